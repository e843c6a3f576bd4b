//! Chain provider with multi-RPC support and automatic failover

use super::{ChainRpc, NativeCurrency, RelayStatus};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use serde::Deserialize;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Private relay endpoint, if the chain has one
    private_provider: Option<Provider<Http>>,
    /// HTTP client and base URL for the relay's status lookup
    relay_status: Option<(reqwest::Client, String)>,
}

/// Body of the relay status lookup
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayStatusResponse {
    status: String,
    #[serde(default)]
    sim_error: Option<String>,
}

impl From<RelayStatusResponse> for RelayStatus {
    fn from(response: RelayStatusResponse) -> Self {
        match response.status.to_ascii_uppercase().as_str() {
            "PENDING" => RelayStatus::Pending,
            "INCLUDED" => RelayStatus::Included,
            "FAILED" => RelayStatus::Failed {
                reason: response.sim_error,
            },
            "CANCELLED" => RelayStatus::Cancelled,
            _ => RelayStatus::Unknown,
        }
    }
}

impl ChainProvider {
    pub async fn new(config: ChainConfig) -> OrchestratorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(OrchestratorError::Rpc {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let private_provider = match config.private_rpc_url {
            Some(ref url) => Some(Provider::<Http>::try_from(url.as_str()).map_err(|e| {
                OrchestratorError::Config(format!(
                    "Invalid private RPC URL for chain {}: {}",
                    config.chain_id, e
                ))
            })?),
            None => None,
        };

        let relay_status = match config.private_relay_status_url {
            Some(ref url) => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .map_err(|e| {
                        OrchestratorError::Config(format!("Invalid relay status client: {}", e))
                    })?;
                Some((client, url.trim_end_matches('/').to_string()))
            }
            None => None,
        };

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            private_provider,
            relay_status,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn rpc_error(&self, message: impl ToString) -> OrchestratorError {
        OrchestratorError::Rpc {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> OrchestratorResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))?
            .ok_or_else(|| OrchestratorError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| OrchestratorError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Max fee = 2 * base_fee + priority_fee
        let max_fee = base_fee * 2 + priority_fee;

        // Cap at configured max
        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    async fn legacy_gas_price(&self) -> OrchestratorResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))
    }
}

#[async_trait]
impl ChainRpc for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
            {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get transaction count from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(OrchestratorError::Nonce {
            chain_id: self.config.chain_id,
            message: "All providers failed to return a transaction count".to_string(),
        })
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!(
                        "Failed to get receipt {:?} from chain {}: {}",
                        hash, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.rpc_error("All providers failed to return a receipt"))
    }

    async fn transaction_exists(&self, hash: H256) -> OrchestratorResult<bool> {
        self.http()
            .get_transaction(hash)
            .await
            .map(|tx| tx.is_some())
            .map_err(|e| self.rpc_error(e))
    }

    async fn send_raw_transaction(
        &self,
        raw: Bytes,
        via_private_relay: bool,
    ) -> OrchestratorResult<H256> {
        let provider = match (via_private_relay, &self.private_provider) {
            (true, Some(private)) => private,
            _ => self.http(),
        };

        // Errors keep the node's message; callers classify it
        provider
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| self.rpc_error(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> OrchestratorResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))
    }

    /// Get current gas price based on chain strategy
    async fn get_gas_price(&self) -> OrchestratorResult<GasPrice> {
        match self.config.gas_price_strategy {
            // Arbitrum prices L1 + L2 gas behind a single legacy price
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                Ok(GasPrice::Legacy(self.legacy_gas_price().await?))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    fn supports_private_relay(&self) -> bool {
        self.private_provider.is_some()
    }

    async fn private_relay_status(&self, hash: H256) -> OrchestratorResult<RelayStatus> {
        let (client, base_url) = match self.relay_status {
            Some(ref relay) => relay,
            None => return Ok(RelayStatus::Unknown),
        };

        let response = client
            .get(format!("{}/{:?}", base_url, hash))
            .send()
            .await
            .map_err(|e| self.rpc_error(e))?;
        if !response.status().is_success() {
            return Err(self.rpc_error(format!(
                "Relay status lookup returned {}",
                response.status()
            )));
        }

        let body: RelayStatusResponse = response.json().await.map_err(|e| self.rpc_error(e))?;
        debug!("Relay status for {:?} on chain {}: {}", hash, self.config.chain_id, body.status);
        Ok(body.into())
    }

    fn native_currency(&self) -> NativeCurrency {
        NativeCurrency {
            symbol: self.config.native_currency_symbol.clone(),
            address: self.config.native_currency_address.clone(),
        }
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
