//! Price oracle cache
//!
//! Short-TTL cached USD/ETH spot price from the remote feed. Refreshes
//! are single-flight: the cache mutex is held across the fetch, so
//! concurrent callers on a miss wait for the winner and then reuse its
//! sample instead of hammering the feed. A refresh failure falls back to
//! the last known value; the cache fails only if nothing was ever fetched.

use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::PriceConfig;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price feed request failed: {0}")]
    Feed(#[from] reqwest::Error),
    #[error("malformed price feed response: {0}")]
    Malformed(String),
    #[error("no USD/ETH price has ever been fetched")]
    Unavailable,
}

/// Last successful sample; in-memory only, never persisted.
#[derive(Debug, Clone, Copy)]
struct PriceSample {
    value: Decimal,
    fetched_at: Instant,
}

pub struct PriceOracle {
    client: reqwest::Client,
    feed_url: String,
    ttl: Duration,
    state: Mutex<Option<PriceSample>>,
}

impl PriceOracle {
    pub fn new(config: &PriceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            feed_url: config.feed_url.clone(),
            ttl: Duration::from_millis(config.cache_ttl_ms),
            state: Mutex::new(None),
        })
    }

    /// Current USD/ETH spot price.
    ///
    /// Returns the cached sample inside its validity window, otherwise
    /// refreshes. Never fails for a merely stale cache.
    pub async fn get_price(&self) -> Result<Decimal, PriceError> {
        let mut state = self.state.lock().await;
        if let Some(sample) = state.as_ref() {
            if sample.fetched_at.elapsed() < self.ttl {
                return Ok(sample.value);
            }
        }

        match self.fetch().await {
            Ok(value) => {
                debug!(price = %value, "fetched USD/ETH price");
                *state = Some(PriceSample {
                    value,
                    fetched_at: Instant::now(),
                });
                Ok(value)
            }
            Err(err) => match state.as_ref() {
                Some(sample) => {
                    warn!(error = %err, stale_price = %sample.value, "price refresh failed, using last known value");
                    Ok(sample.value)
                }
                None => {
                    warn!(error = %err, "price refresh failed with no cached value");
                    Err(PriceError::Unavailable)
                }
            },
        }
    }

    async fn fetch(&self) -> Result<Decimal, PriceError> {
        let body: serde_json::Value = self
            .client
            .get(&self.feed_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let quote = body
            .get("ethereum")
            .and_then(|v| v.get("usd"))
            .ok_or_else(|| PriceError::Malformed(body.to_string()))?;
        // serde_json's arbitrary_precision keeps the number as its source
        // literal, so the quote parses into Decimal without an f64 detour.
        quote
            .to_string()
            .parse::<Decimal>()
            .map_err(|_| PriceError::Malformed(quote.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn unreachable_oracle(ttl_ms: u64) -> PriceOracle {
        PriceOracle::new(&PriceConfig {
            // Port 9 (discard) refuses immediately; no fetch can succeed.
            feed_url: "http://127.0.0.1:9/price".to_string(),
            cache_ttl_ms: ttl_ms,
            request_timeout_ms: 200,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unavailable_when_nothing_was_ever_fetched() {
        let oracle = unreachable_oracle(3_000);
        assert!(matches!(
            oracle.get_price().await,
            Err(PriceError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn stale_cache_falls_back_to_last_known_value() {
        // Zero TTL makes every cached sample stale, forcing the refresh
        // path (which fails) on each call.
        let oracle = unreachable_oracle(0);
        *oracle.state.lock().await = Some(PriceSample {
            value: dec!(1850.25),
            fetched_at: Instant::now(),
        });

        assert_eq!(oracle.get_price().await.unwrap(), dec!(1850.25));
        // Still served after repeated failed refreshes.
        assert_eq!(oracle.get_price().await.unwrap(), dec!(1850.25));
    }

    #[tokio::test]
    async fn fresh_cache_is_served_without_a_fetch() {
        let oracle = unreachable_oracle(60_000);
        *oracle.state.lock().await = Some(PriceSample {
            value: dec!(2000),
            fetched_at: Instant::now(),
        });
        assert_eq!(oracle.get_price().await.unwrap(), dec!(2000));
    }
}
