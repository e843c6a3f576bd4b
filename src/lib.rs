//! Wallet transaction lifecycle orchestrator
//!
//! Prepares, signs and submits EVM transactions with locally coordinated
//! nonces, then follows them (or off-chain orders) until they settle and
//! records the network fee paid.

pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod orders;
pub mod state;
pub mod tx;

#[cfg(test)]
mod test_util;

pub use error::{OrchestratorError, OrchestratorResult};
pub use lifecycle::{ExecuteOptions, TransactionLifecycle};
