//! Persisted store seam
//!
//! The reconciliation engine talks to the off-chain store through the
//! [`Store`] trait; `record_donation` is the single transaction that
//! keeps invariant `amountCollected == Σ donations.amountEth` intact.
//! [`MemoryStore`] is the bundled implementation: one mutex over the
//! record maps is the transaction scope, so every operation commits
//! fully or not at all even under concurrent reconciliation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ledger;
use crate::types::{Charity, CharityStatus, Donation, DonorRef, PublicUser};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("charity {0} already exists")]
    DuplicateCharity(String),
    #[error("donation {0} already recorded")]
    DuplicateDonation(String),
    #[error("charity {0} does not exist")]
    UnknownCharity(String),
    #[error("amount overflow while updating {0}")]
    Overflow(String),
}

/// Insert payload for a charity, already decoded and typed.
#[derive(Debug, Clone)]
pub struct NewCharity {
    pub chain_id: String,
    pub owner_wallet: String,
    pub title: String,
    pub description: String,
    pub target: Option<Decimal>,
    pub deadline: Option<DateTime<Utc>>,
    pub image: String,
    /// Off-chain id of the owning user, when the event carried one
    pub owner_user_id: Option<String>,
}

/// Insert payload for a donation.
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub charity_id: String,
    pub sender_wallet: String,
    pub amount_eth: Decimal,
    pub amount_usd: Decimal,
    pub tx_hash: String,
    /// Off-chain donor id from the event; resolved inside the transaction
    pub user_id: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_charity(&self, chain_id: &str) -> Result<Option<Charity>, StoreError>;

    /// Insert a charity created on chain. Fails with `DuplicateCharity`
    /// when the chain id is already present.
    async fn insert_charity(&self, new: NewCharity) -> Result<Charity, StoreError>;

    async fn find_donation_by_tx(&self, tx_hash: &str) -> Result<Option<Donation>, StoreError>;

    /// One atomic transaction: resolve the donor (registered user by id,
    /// known anonymous donor by id, else mint a fresh anonymous donor),
    /// insert the donation, add the USD amount to the donor's running
    /// total and the ETH amount to the charity's `amountCollected`.
    async fn record_donation(&self, new: NewDonation) -> Result<Donation, StoreError>;
}

/// Registered user row (donor aggregate included).
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub amount_sent_in_dollars: Decimal,
}

/// Wallet-only donor aggregate.
#[derive(Debug, Clone)]
pub struct AnonymousRecord {
    pub id: String,
    pub amount_sent_in_dollars: Decimal,
}

#[derive(Debug, Default)]
struct MemoryInner {
    charities: HashMap<String, Charity>,
    /// Keyed by tx hash, the dedup key
    donations: HashMap<String, Donation>,
    users: HashMap<String, UserRecord>,
    anonymous: HashMap<String, AnonymousRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or update a registered user (profile sync happens out of band).
    pub async fn upsert_user(&self, user: UserRecord) {
        self.inner.lock().await.users.insert(user.id.clone(), user);
    }

    pub async fn user_total(&self, id: &str) -> Option<Decimal> {
        self.inner
            .lock()
            .await
            .users
            .get(id)
            .map(|u| u.amount_sent_in_dollars)
    }

    pub async fn anonymous_total(&self, id: &str) -> Option<Decimal> {
        self.inner
            .lock()
            .await
            .anonymous
            .get(id)
            .map(|a| a.amount_sent_in_dollars)
    }

    /// All donations recorded for a charity, unordered.
    pub async fn donations_for(&self, charity_id: &str) -> Vec<Donation> {
        self.inner
            .lock()
            .await
            .donations
            .values()
            .filter(|d| d.charity_id == charity_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_charity(&self, chain_id: &str) -> Result<Option<Charity>, StoreError> {
        Ok(self.inner.lock().await.charities.get(chain_id).cloned())
    }

    async fn insert_charity(&self, new: NewCharity) -> Result<Charity, StoreError> {
        let NewCharity {
            chain_id,
            owner_wallet,
            title,
            description,
            target,
            deadline,
            image,
            owner_user_id,
        } = new;

        let mut inner = self.inner.lock().await;
        if inner.charities.contains_key(&chain_id) {
            return Err(StoreError::DuplicateCharity(chain_id));
        }

        let owner = owner_user_id
            .as_deref()
            .and_then(|uid| inner.users.get(uid))
            .map(|u| PublicUser {
                id: u.id.clone(),
                name: u.name.clone(),
                image: u.image.clone(),
            });

        let now = Utc::now();
        let charity = Charity {
            id: chain_id.clone(),
            owner_wallet,
            title,
            description,
            target,
            deadline,
            amount_collected: Decimal::ZERO,
            image,
            status: CharityStatus::Active,
            owner,
            created_at: now,
            updated_at: now,
        };
        inner.charities.insert(chain_id, charity.clone());
        Ok(charity)
    }

    async fn find_donation_by_tx(&self, tx_hash: &str) -> Result<Option<Donation>, StoreError> {
        Ok(self.inner.lock().await.donations.get(tx_hash).cloned())
    }

    async fn record_donation(&self, new: NewDonation) -> Result<Donation, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.donations.contains_key(&new.tx_hash) {
            return Err(StoreError::DuplicateDonation(new.tx_hash));
        }

        let charity = inner
            .charities
            .get(&new.charity_id)
            .ok_or_else(|| StoreError::UnknownCharity(new.charity_id.clone()))?;
        let collected = ledger::add(charity.amount_collected, new.amount_eth)
            .map_err(|_| StoreError::Overflow(new.charity_id.clone()))?;

        // Resolve the donor and compute its new running total before any
        // mutation, so a failure leaves the store untouched.
        enum DonorSlot {
            User(String),
            Anonymous(String),
            FreshAnonymous(String),
        }
        let (slot, donor, total) = match new.user_id.as_deref() {
            Some(uid) if inner.users.contains_key(uid) => {
                let user = &inner.users[uid];
                let total = ledger::add(user.amount_sent_in_dollars, new.amount_usd)
                    .map_err(|_| StoreError::Overflow(uid.to_string()))?;
                (
                    DonorSlot::User(uid.to_string()),
                    DonorRef::User {
                        id: user.id.clone(),
                        name: user.name.clone(),
                        image: user.image.clone(),
                    },
                    total,
                )
            }
            Some(uid) if inner.anonymous.contains_key(uid) => {
                let total =
                    ledger::add(inner.anonymous[uid].amount_sent_in_dollars, new.amount_usd)
                        .map_err(|_| StoreError::Overflow(uid.to_string()))?;
                (
                    DonorSlot::Anonymous(uid.to_string()),
                    DonorRef::Anonymous {
                        id: uid.to_string(),
                    },
                    total,
                )
            }
            _ => {
                let id = Uuid::new_v4().to_string();
                (
                    DonorSlot::FreshAnonymous(id.clone()),
                    DonorRef::Anonymous { id },
                    new.amount_usd,
                )
            }
        };

        let donation = Donation {
            id: Uuid::new_v4().to_string(),
            charity_id: new.charity_id.clone(),
            sender_wallet: new.sender_wallet,
            amount_eth: new.amount_eth,
            amount_usd: new.amount_usd,
            tx_hash: new.tx_hash.clone(),
            donor,
            created_at: Utc::now(),
        };

        // Commit point: everything below must succeed together.
        match slot {
            DonorSlot::User(uid) => {
                if let Some(user) = inner.users.get_mut(&uid) {
                    user.amount_sent_in_dollars = total;
                }
            }
            DonorSlot::Anonymous(uid) => {
                if let Some(anon) = inner.anonymous.get_mut(&uid) {
                    anon.amount_sent_in_dollars = total;
                }
            }
            DonorSlot::FreshAnonymous(uid) => {
                inner.anonymous.insert(
                    uid.clone(),
                    AnonymousRecord {
                        id: uid,
                        amount_sent_in_dollars: total,
                    },
                );
            }
        }
        if let Some(charity) = inner.charities.get_mut(&new.charity_id) {
            charity.amount_collected = collected;
            charity.updated_at = donation.created_at;
        }
        inner.donations.insert(new.tx_hash, donation.clone());

        Ok(donation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_charity(id: &str) -> NewCharity {
        NewCharity {
            chain_id: id.to_string(),
            owner_wallet: "0xowner".to_string(),
            title: "Clean water".to_string(),
            description: "wells".to_string(),
            target: Some(dec!(10)),
            deadline: None,
            image: String::new(),
            owner_user_id: None,
        }
    }

    fn new_donation(charity_id: &str, tx: &str, eth: Decimal, usd: Decimal) -> NewDonation {
        NewDonation {
            charity_id: charity_id.to_string(),
            sender_wallet: "0xdead".to_string(),
            amount_eth: eth,
            amount_usd: usd,
            tx_hash: tx.to_string(),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_chain_id_is_rejected() {
        let store = MemoryStore::new();
        store.insert_charity(new_charity("1")).await.unwrap();
        assert!(matches!(
            store.insert_charity(new_charity("1")).await,
            Err(StoreError::DuplicateCharity(_))
        ));
    }

    #[tokio::test]
    async fn donation_to_unknown_charity_leaves_no_trace() {
        let store = MemoryStore::new();
        let result = store
            .record_donation(new_donation("404", "0xtx", dec!(0.5), dec!(1000)))
            .await;
        assert!(matches!(result, Err(StoreError::UnknownCharity(_))));
        assert!(store.find_donation_by_tx("0xtx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_donor_mints_a_fresh_anonymous_aggregate() {
        let store = MemoryStore::new();
        store.insert_charity(new_charity("1")).await.unwrap();
        let donation = store
            .record_donation(new_donation("1", "0xtx", dec!(0.1), dec!(200)))
            .await
            .unwrap();

        let DonorRef::Anonymous { id } = donation.donor else {
            panic!("expected anonymous donor");
        };
        assert_eq!(store.anonymous_total(&id).await, Some(dec!(200)));
    }

    #[tokio::test]
    async fn registered_donor_total_accumulates_transactionally() {
        let store = MemoryStore::new();
        store.insert_charity(new_charity("1")).await.unwrap();
        store
            .upsert_user(UserRecord {
                id: "u1".to_string(),
                name: Some("Ada".to_string()),
                image: None,
                amount_sent_in_dollars: dec!(50),
            })
            .await;

        let mut donation = new_donation("1", "0xa", dec!(0.1), dec!(200));
        donation.user_id = Some("u1".to_string());
        store.record_donation(donation).await.unwrap();

        assert_eq!(store.user_total("u1").await, Some(dec!(250)));
        let charity = store.find_charity("1").await.unwrap().unwrap();
        assert_eq!(charity.amount_collected, dec!(0.1));
    }
}
