//! Configuration management for the relay
//!
//! Loads defaults + optional YAML/TOML files + environment variables
//! (CHARIO_* via .env).

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use ethers::types::Address;
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub chain: ChainConfig,
    pub price: PriceConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// SSE gateway listen port
    pub port: u16,
    /// Single origin allowed by CORS
    pub cors_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// WebSocket JSON-RPC endpoint of the node
    pub ws_url: String,
    /// Deployed charity contract address
    pub contract_address: String,
    /// Base resubscribe delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Resubscribe delay cap in milliseconds
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceConfig {
    /// USD/ETH spot price endpoint
    pub feed_url: String,
    /// Cache validity window in milliseconds
    pub cache_ttl_ms: u64,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// SSE heartbeat cadence in milliseconds
    pub heartbeat_ms: u64,
}

impl ChainConfig {
    pub fn contract_address(&self) -> Result<Address> {
        self.contract_address
            .parse::<Address>()
            .with_context(|| format!("invalid contract address: {}", self.contract_address))
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Server defaults
            .set_default("server.port", 3001)?
            .set_default("server.cors_origin", "http://localhost:3000")?
            // Chain defaults (local Hardhat node + first deployed contract)
            .set_default("chain.ws_url", "ws://localhost:8545")?
            .set_default(
                "chain.contract_address",
                "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            )?
            .set_default("chain.reconnect_base_ms", 1_000)?
            .set_default("chain.reconnect_max_ms", 60_000)?
            // Price feed defaults
            .set_default(
                "price.feed_url",
                "https://api.coingecko.com/api/v3/simple/price?ids=ethereum&vs_currencies=usd",
            )?
            .set_default("price.cache_ttl_ms", 3_000)?
            .set_default("price.request_timeout_ms", 5_000)?
            // Stream defaults
            .set_default("stream.heartbeat_ms", 1_000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CHARIO_*)
            .add_source(Environment::with_prefix("CHARIO").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config for startup logging
    pub fn digest(&self) -> String {
        format!(
            "port={} origin={} node={} contract={} price_ttl_ms={} heartbeat_ms={}",
            self.server.port,
            self.server.cors_origin,
            self.chain.ws_url,
            self.chain.contract_address,
            self.price.cache_ttl_ms,
            self.stream.heartbeat_ms
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.server.cors_origin, "http://localhost:3000");
        assert_eq!(config.price.cache_ttl_ms, 3_000);
        assert!(config.chain.contract_address().is_ok());
    }
}
