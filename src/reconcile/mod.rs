//! Reconciliation engine
//!
//! Applies decoded chain events to the store idempotently and fans the
//! resulting domain events out on the bus. Duplicate deliveries are
//! absorbed via the natural keys (chain id, tx hash); an event that
//! references an unknown charity is an error for the caller to log and
//! drop, never a partial write.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::chain::{ChainEvent, ChainEventKind, CharityCreatedEvent, DonationReceivedEvent};
use crate::ledger::{self, LedgerError};
use crate::oracle::PriceOracle;
use crate::store::{NewCharity, NewDonation, Store, StoreError};
use crate::types::{Charity, Donation, DomainEvent};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// All collaborators are injected; tests run several independent
/// engines against their own buses and stores.
pub struct Reconciler {
    store: Arc<dyn Store>,
    oracle: Arc<PriceOracle>,
    bus: EventBus,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, oracle: Arc<PriceOracle>, bus: EventBus) -> Self {
        Self { store, oracle, bus }
    }

    /// Consume chain events until the source hangs up. Each event is
    /// handled on its own task, so deliveries reconcile concurrently;
    /// the store's transaction keeps that safe.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ChainEvent>) {
        while let Some(event) = rx.recv().await {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = engine.apply(&event).await {
                    error!(
                        kind = event.kind_name(),
                        tx_hash = %event.tx_hash,
                        error = %err,
                        "failed to reconcile chain event, dropping"
                    );
                }
            });
        }
        info!("chain event source closed, reconciler stopping");
    }

    pub async fn apply(&self, event: &ChainEvent) -> Result<(), ReconcileError> {
        match &event.kind {
            ChainEventKind::CharityCreated(payload) => {
                self.apply_charity_created(payload).await?;
            }
            ChainEventKind::DonationReceived(payload) => {
                self.apply_donation_received(payload, &event.tx_hash).await?;
            }
        }
        Ok(())
    }

    /// Idempotent on the chain-assigned charity id: a duplicate delivery
    /// returns the stored row unchanged and publishes nothing.
    pub async fn apply_charity_created(
        &self,
        event: &CharityCreatedEvent,
    ) -> Result<Charity, ReconcileError> {
        if let Some(existing) = self.store.find_charity(&event.charity_id).await? {
            debug!(charity_id = %event.charity_id, "duplicate CharityCreated absorbed");
            return Ok(existing);
        }

        let new = NewCharity {
            chain_id: event.charity_id.clone(),
            owner_wallet: event.owner_wallet.clone(),
            title: event.title.clone(),
            description: event.description.clone(),
            target: event.target,
            deadline: event.deadline,
            image: event.image.clone(),
            owner_user_id: event.user_id.clone(),
        };
        let charity = match self.store.insert_charity(new).await {
            Ok(charity) => charity,
            // Lost an insert race against a concurrent duplicate delivery;
            // the stored row wins.
            Err(StoreError::DuplicateCharity(_)) => {
                return Ok(self
                    .store
                    .find_charity(&event.charity_id)
                    .await?
                    .ok_or_else(|| StoreError::UnknownCharity(event.charity_id.clone()))?);
            }
            Err(err) => return Err(err.into()),
        };

        self.bus.publish(
            &Topic::new_charity(),
            DomainEvent::NewCharity {
                charity: charity.clone(),
            },
        );
        info!(charity_id = %charity.id, title = %charity.title, "processed charity creation");
        Ok(charity)
    }

    /// Idempotent on tx hash. The price lookup is best-effort: an
    /// unavailable feed records the donation with a zero USD estimate
    /// instead of discarding it.
    pub async fn apply_donation_received(
        &self,
        event: &DonationReceivedEvent,
        tx_hash: &str,
    ) -> Result<Donation, ReconcileError> {
        if let Some(existing) = self.store.find_donation_by_tx(tx_hash).await? {
            debug!(tx_hash = %tx_hash, "duplicate DonationReceived absorbed");
            return Ok(existing);
        }

        let amount_usd = match self.oracle.get_price().await {
            Ok(price) => ledger::usd_value(event.amount_eth, price)?,
            Err(err) => {
                warn!(tx_hash = %tx_hash, error = %err, "price unavailable, recording donation with zero USD value");
                Decimal::ZERO
            }
        };

        let new = NewDonation {
            charity_id: event.charity_id.clone(),
            sender_wallet: event.donor_wallet.clone(),
            amount_eth: event.amount_eth,
            amount_usd,
            tx_hash: tx_hash.to_string(),
            user_id: event.user_id.clone(),
        };
        let donation = match self.store.record_donation(new).await {
            Ok(donation) => donation,
            // Concurrent duplicate delivery committed first; absorb it.
            Err(StoreError::DuplicateDonation(_)) => {
                return Ok(self
                    .store
                    .find_donation_by_tx(tx_hash)
                    .await?
                    .ok_or(StoreError::DuplicateDonation(tx_hash.to_string()))?);
            }
            Err(err) => return Err(err.into()),
        };

        self.bus.publish(
            &Topic::donations(&event.charity_id),
            DomainEvent::NewDonation {
                donation: donation.clone(),
            },
        );
        info!(
            charity_id = %event.charity_id,
            amount_eth = %ledger::format_eth(donation.amount_eth),
            donor = %donation.sender_wallet,
            "processed donation"
        );
        Ok(donation)
    }
}
