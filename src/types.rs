//! Domain model shared across the relay
//!
//! Wire names are camelCase to match the JSON contract the frontend
//! already consumes; all monetary fields are `Decimal` and serialize
//! as strings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Charity lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CharityStatus {
    Active,
    Inactive,
}

/// Owner view exposed to clients (public fields only, never email)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
}

/// Off-chain charity record, keyed by its chain-assigned id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Charity {
    /// Chain-assigned id; immutable, unique, the natural idempotency key
    pub id: String,
    pub owner_wallet: String,
    pub title: String,
    pub description: String,
    /// Fundraising target in ETH; `None` when the campaign is open-ended
    pub target: Option<Decimal>,
    pub deadline: Option<DateTime<Utc>>,
    /// Running ETH total; monotonically non-decreasing
    pub amount_collected: Decimal,
    pub image: String,
    pub status: CharityStatus,
    pub owner: Option<PublicUser>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who a donation is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DonorRef {
    #[serde(rename_all = "camelCase")]
    User {
        id: String,
        name: Option<String>,
        image: Option<String>,
    },
    Anonymous { id: String },
}

/// Off-chain donation record; `tx_hash` is unique and dedups replays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: String,
    pub charity_id: String,
    pub sender_wallet: String,
    pub amount_eth: Decimal,
    /// Best-effort USD estimate at donation time; zero when the price
    /// feed was unavailable
    pub amount_usd: Decimal,
    pub tx_hash: String,
    pub donor: DonorRef,
    pub created_at: DateTime<Utc>,
}

/// Reconciled event fanned out on the internal bus and over SSE
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "new-charity")]
    NewCharity { charity: Charity },
    #[serde(rename = "new-donation")]
    NewDonation { donation: Donation },
}

impl DomainEvent {
    /// SSE event name for this payload
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::NewCharity { .. } => "new-charity",
            DomainEvent::NewDonation { .. } => "new-donation",
        }
    }
}
