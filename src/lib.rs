//! Chario Relay Library
//!
//! Bridges the Chario charity contract with the off-chain read store and
//! live SSE clients: chain log ingestion, idempotent reconciliation,
//! process-local fan-out, and the streaming gateway.

pub mod backoff;
pub mod bus;
pub mod chain;
pub mod client;
pub mod config;
pub mod ledger;
pub mod oracle;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod types;
