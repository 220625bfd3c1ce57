//! Chain event source
//!
//! One persistent log subscription on the charity contract, decoding the
//! two event kinds the relay cares about. Each log is decoded exactly
//! once at this boundary into a strongly-typed [`ChainEvent`]; downstream
//! code never re-inspects raw ABI arguments. Delivery to the channel is
//! at-least-once: a lost node connection is logged and resubscribed,
//! never fatal.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Address, Filter, Log, H256, U256};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::ChainConfig;
use crate::ledger::{self, LedgerError};

#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "CharityCreated",
    abi = "CharityCreated(uint256,address,string,string,uint256,uint256,string,string)"
)]
struct CharityCreatedFilter {
    charity_id: U256,
    owner: Address,
    title: String,
    description: String,
    target: U256,
    deadline: U256,
    image: String,
    user_id: String,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "DonationReceived",
    abi = "DonationReceived(uint256,address,uint256,string)"
)]
struct DonationReceivedFilter {
    charity_id: U256,
    donor: Address,
    amount: U256,
    user_id: String,
}

/// Decoded `CharityCreated` payload. Zero target/deadline mean "not set".
#[derive(Debug, Clone)]
pub struct CharityCreatedEvent {
    pub charity_id: String,
    pub owner_wallet: String,
    pub title: String,
    pub description: String,
    pub target: Option<Decimal>,
    pub deadline: Option<DateTime<Utc>>,
    pub image: String,
    pub user_id: Option<String>,
}

/// Decoded `DonationReceived` payload, amount already in ETH.
#[derive(Debug, Clone)]
pub struct DonationReceivedEvent {
    pub charity_id: String,
    pub donor_wallet: String,
    pub amount_eth: Decimal,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ChainEventKind {
    CharityCreated(CharityCreatedEvent),
    DonationReceived(DonationReceivedEvent),
}

/// Tagged domain event handed to the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub kind: ChainEventKind,
    pub tx_hash: String,
    pub block_number: u64,
}

impl ChainEvent {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ChainEventKind::CharityCreated(_) => "CharityCreated",
            ChainEventKind::DonationReceived(_) => "DonationReceived",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("abi decode failed: {0}")]
    Abi(#[from] ethers::abi::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("log has no transaction hash")]
    MissingTxHash,
    #[error("deadline {0} is out of range")]
    DeadlineOutOfRange(String),
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn deadline_from_secs(deadline: U256) -> Result<DateTime<Utc>, DecodeError> {
    if deadline > U256::from(i64::MAX as u64) {
        return Err(DecodeError::DeadlineOutOfRange(deadline.to_string()));
    }
    DateTime::<Utc>::from_timestamp(deadline.as_u64() as i64, 0)
        .ok_or_else(|| DecodeError::DeadlineOutOfRange(deadline.to_string()))
}

/// Decode a raw contract log. `Ok(None)` means an event kind the relay
/// does not handle.
pub fn decode_log(log: &Log) -> Result<Option<ChainEvent>, DecodeError> {
    let Some(&topic0) = log.topics.first() else {
        return Ok(None);
    };
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };

    let kind = if topic0 == CharityCreatedFilter::signature() {
        let ev = CharityCreatedFilter::decode_log(&raw)?;
        ChainEventKind::CharityCreated(CharityCreatedEvent {
            charity_id: ev.charity_id.to_string(),
            owner_wallet: format!("{:#x}", ev.owner),
            title: ev.title,
            description: ev.description,
            target: if ev.target.is_zero() {
                None
            } else {
                Some(ledger::wei_to_eth(ev.target)?)
            },
            deadline: if ev.deadline.is_zero() {
                None
            } else {
                Some(deadline_from_secs(ev.deadline)?)
            },
            image: ev.image,
            user_id: none_if_empty(ev.user_id),
        })
    } else if topic0 == DonationReceivedFilter::signature() {
        let ev = DonationReceivedFilter::decode_log(&raw)?;
        ChainEventKind::DonationReceived(DonationReceivedEvent {
            charity_id: ev.charity_id.to_string(),
            donor_wallet: format!("{:#x}", ev.donor),
            amount_eth: ledger::wei_to_eth(ev.amount)?,
            user_id: none_if_empty(ev.user_id),
        })
    } else {
        return Ok(None);
    };

    let tx_hash = log
        .transaction_hash
        .map(|h: H256| format!("{h:#x}"))
        .ok_or(DecodeError::MissingTxHash)?;
    let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or_default();

    Ok(Some(ChainEvent {
        kind,
        tx_hash,
        block_number,
    }))
}

/// Persistent subscription to the contract's logs.
pub struct ChainSource {
    ws_url: String,
    address: Address,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl ChainSource {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        Ok(Self {
            ws_url: config.ws_url.clone(),
            address: config.contract_address()?,
            backoff_base: Duration::from_millis(config.reconnect_base_ms),
            backoff_max: Duration::from_millis(config.reconnect_max_ms),
        })
    }

    /// Listen forever, resubscribing on any node failure. Returns only
    /// when the receiving side of `tx` is gone.
    pub async fn run(self, tx: mpsc::Sender<ChainEvent>) {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);
        loop {
            match self.stream_logs(&tx, &mut backoff).await {
                Ok(()) => {
                    info!("chain event channel closed, stopping listener");
                    return;
                }
                Err(err) => warn!(error = %err, "contract log subscription lost"),
            }
            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "resubscribing to contract logs");
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_logs(
        &self,
        tx: &mpsc::Sender<ChainEvent>,
        backoff: &mut Backoff,
    ) -> Result<()> {
        let provider = Provider::<Ws>::connect(&self.ws_url)
            .await
            .context("failed to connect to node")?;
        let filter = Filter::new().address(self.address);
        let mut stream = provider
            .subscribe_logs(&filter)
            .await
            .context("failed to subscribe to contract logs")?;
        backoff.reset();
        info!(contract = %format!("{:#x}", self.address), "listening for contract events");

        while let Some(log) = stream.next().await {
            match decode_log(&log) {
                Ok(Some(event)) => {
                    debug!(
                        kind = event.kind_name(),
                        tx_hash = %event.tx_hash,
                        block = event.block_number,
                        "decoded contract event"
                    );
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => debug!(topics = ?log.topics, "ignoring unhandled contract event"),
                Err(err) => warn!(error = %err, "failed to decode contract log, dropping"),
            }
        }
        bail!("log stream ended")
    }
}
