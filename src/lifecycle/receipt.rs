//! Receipt polling with a hard deadline

use crate::chain::{ChainManager, RelayStatus};
use crate::clock::Clock;
use crate::error::{ErrorContext, OrchestratorError, OrchestratorResult};
use crate::state::{NetworkFee, Receipt, TransactionDetails, TransactionStatus};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct ReceiptWatcher {
    chains: Arc<ChainManager>,
    timeout: Duration,
    poll_interval: Duration,
    clock: Clock,
}

impl ReceiptWatcher {
    pub fn new(
        chains: Arc<ChainManager>,
        timeout: Duration,
        poll_interval: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            chains,
            timeout,
            poll_interval,
            clock,
        }
    }

    /// Poll until the transaction is mined. A `Timeout` error is inconclusive:
    /// the transaction may still be mined later.
    pub async fn wait_for_receipt(&self, chain_id: u64, hash: H256) -> OrchestratorResult<Receipt> {
        let context = ErrorContext::new("ReceiptWatcher", "wait_for_receipt").chain(chain_id);

        match timeout(self.timeout, self.poll_receipt(chain_id, hash)).await {
            Ok(result) => result.map_err(|e| e.tagged(context)),
            Err(_) => {
                warn!(
                    "No receipt for {:?} on chain {} after {:?}",
                    hash, chain_id, self.timeout
                );
                crate::metrics::record_receipt_timeout(chain_id);
                Err(OrchestratorError::Timeout {
                    operation: format!("receipt for {:?}", hash),
                }
                .tagged(context))
            }
        }
    }

    async fn poll_receipt(&self, chain_id: u64, hash: H256) -> OrchestratorResult<Receipt> {
        let provider = self.chains.get_provider(chain_id)?;

        loop {
            match provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    let receipt = Receipt::from_ethers(&receipt, self.clock.now_ms());
                    info!(
                        "Receipt for {:?} on chain {}: success={} block={:?}",
                        hash, chain_id, receipt.success, receipt.block_number
                    );
                    crate::metrics::record_receipt(chain_id, receipt.success);
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(e) => debug!("Receipt lookup for {:?} failed: {}", hash, e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Ask the private relay about a transaction until it stops reporting it
    /// as pending. Returns the final status only when the relay says the
    /// transaction will never be mined; `None` leaves the verdict to the
    /// receipt.
    pub async fn wait_for_relay_verdict(
        &self,
        chain_id: u64,
        hash: H256,
    ) -> Option<TransactionStatus> {
        let provider = match self.chains.get_provider(chain_id) {
            Ok(provider) => provider,
            Err(e) => {
                debug!("No relay status for chain {}: {}", chain_id, e);
                return None;
            }
        };

        loop {
            match provider.private_relay_status(hash).await {
                Ok(RelayStatus::Pending) => {}
                Ok(RelayStatus::Failed { reason }) => {
                    warn!(
                        "Private relay dropped {:?} on chain {}: {}",
                        hash,
                        chain_id,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    return Some(TransactionStatus::Failed);
                }
                Ok(RelayStatus::Cancelled) => {
                    info!("Private relay cancelled {:?} on chain {}", hash, chain_id);
                    return Some(TransactionStatus::Canceled);
                }
                Ok(status) => {
                    debug!("Relay status for {:?}: {:?}", hash, status);
                    return None;
                }
                Err(e) => {
                    debug!("Relay status lookup for {:?} failed: {}", hash, e);
                    return None;
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// gas used x effective gas price, in the chain's native currency
    pub fn network_fee(&self, chain_id: u64, receipt: &Receipt) -> OrchestratorResult<NetworkFee> {
        let native = self.chains.get_provider(chain_id)?.native_currency();
        let quantity = receipt.gas_used.saturating_mul(receipt.effective_gas_price);

        Ok(NetworkFee {
            quantity: quantity.to_string(),
            token_symbol: native.symbol,
            token_address: native.address,
            chain_id,
        })
    }

    /// After a receipt timeout: whether the transaction can no longer be mined.
    ///
    /// A transaction the provider does not know is gone if it went out publicly.
    /// Privately relayed transactions are invisible until mined, so they only
    /// count as gone once the account's nonce has moved past theirs.
    pub async fn check_invalidated(&self, details: &TransactionDetails) -> OrchestratorResult<bool> {
        let hash = match details.hash {
            Some(hash) => hash,
            None => return Ok(false),
        };
        let provider = self.chains.get_provider(details.chain_id)?;

        if provider.transaction_exists(hash).await? {
            return Ok(false);
        }
        if !details.options.submit_via_private_rpc {
            return Ok(true);
        }

        match details.options.nonce {
            Some(nonce) => Ok(provider.get_transaction_count(details.from).await? > nonce),
            None => Ok(false),
        }
    }
}
