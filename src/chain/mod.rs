//! Chain module - RPC access for every configured chain
//!
//! This module provides:
//! - The `ChainRpc` capability the services consume
//! - Multi-RPC provider management with automatic failover
//! - Optional private relay endpoints per chain

pub mod provider;

pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;
use tracing::info;

/// Native currency of a chain, used to denominate network fees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub symbol: String,
    pub address: String,
}

/// What a private relay reports about a transaction it was handed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// Still waiting for inclusion
    Pending,
    Included,
    /// Dropped by the relay, e.g. after a failed simulation; no receipt will follow
    Failed { reason: Option<String> },
    Cancelled,
    /// The relay does not know the transaction or cannot be asked
    Unknown,
}

/// RPC operations the orchestrator needs from a chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Transaction count for `address` including the provider's pending pool
    async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64>;

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>>;

    /// Whether the provider knows the transaction at all (mined or pending)
    async fn transaction_exists(&self, hash: H256) -> OrchestratorResult<bool>;

    async fn send_raw_transaction(
        &self,
        raw: Bytes,
        via_private_relay: bool,
    ) -> OrchestratorResult<H256>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> OrchestratorResult<U256>;

    async fn get_gas_price(&self) -> OrchestratorResult<GasPrice>;

    fn supports_private_relay(&self) -> bool;

    /// Private relays never return a receipt for transactions they drop
    async fn private_relay_status(&self, hash: H256) -> OrchestratorResult<RelayStatus>;

    fn native_currency(&self) -> NativeCurrency;
}

/// Registry of chain providers by chain id
pub struct ChainManager {
    providers: DashMap<u64, Arc<dyn ChainRpc>>,
}

impl ChainManager {
    /// Connect a provider for every enabled chain
    pub async fn new(settings: &Settings) -> OrchestratorResult<Self> {
        let providers: DashMap<u64, Arc<dyn ChainRpc>> = DashMap::new();

        for (_, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let provider = ChainProvider::new(chain_config.clone()).await?;
            providers.insert(chain_config.chain_id, Arc::new(provider));
        }

        Ok(Self { providers })
    }

    pub fn from_providers(providers: Vec<Arc<dyn ChainRpc>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.chain_id(), p)).collect(),
        }
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> OrchestratorResult<Arc<dyn ChainRpc>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(OrchestratorError::ChainNotFound { chain_id })
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        self.providers.iter().map(|e| *e.key()).collect()
    }
}
