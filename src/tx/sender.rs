//! Broadcast of signed transactions over the public or private relay path

use super::types::SignedTransactionRequest;
use crate::chain::ChainManager;
use crate::error::{ErrorContext, OrchestratorError, OrchestratorResult};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sends signed transactions. Failures are returned to the caller and never
/// retried here; a retry needs a fresh nonce and signature.
pub struct TransactionSubmissionService {
    chains: Arc<ChainManager>,
    submit_timeout: Duration,
}

impl TransactionSubmissionService {
    pub fn new(chains: Arc<ChainManager>, submit_timeout: Duration) -> Self {
        Self {
            chains,
            submit_timeout,
        }
    }

    pub async fn submit(
        &self,
        signed: SignedTransactionRequest,
        submit_via_private_relay: bool,
    ) -> OrchestratorResult<H256> {
        let chain_id = signed.chain_id();
        let context = ErrorContext::new("TransactionSubmissionService", "submit")
            .chain(chain_id)
            .account(signed.request.from);

        let provider = self
            .chains
            .get_provider(chain_id)
            .map_err(|e| e.tagged(context.clone()))?;

        let private = submit_via_private_relay && provider.supports_private_relay();
        if submit_via_private_relay && !private {
            info!(
                "Chain {} has no private relay, sending {:?} publicly",
                chain_id, signed.hash
            );
        }

        debug!(
            "Sending {:?} on chain {}: 0x{}",
            signed.hash,
            chain_id,
            hex::encode(&signed.raw)
        );
        let result = timeout(
            self.submit_timeout,
            provider.send_raw_transaction(signed.raw.clone(), private),
        )
        .await;

        let hash = match result {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                let err = classify_submission_error(chain_id, e);
                warn!(
                    "Submission of {:?} (nonce {}) rejected: {}",
                    signed.hash, signed.nonce, err
                );
                crate::metrics::record_tx_submit_failed(chain_id, failure_kind(&err));
                return Err(err.tagged(context));
            }
            Err(_) => {
                warn!("Submission of {:?} timed out", signed.hash);
                crate::metrics::record_tx_submit_failed(chain_id, "timeout");
                return Err(OrchestratorError::Timeout {
                    operation: "send transaction".to_string(),
                }
                .tagged(context));
            }
        };

        if hash != signed.hash {
            warn!(
                "Node returned hash {:?} for transaction signed as {:?}",
                hash, signed.hash
            );
        }

        info!(
            "Transaction sent: {:?} (nonce {}, chain {}, private {})",
            hash, signed.nonce, chain_id, private
        );
        crate::metrics::record_tx_submitted(chain_id, private);

        Ok(hash)
    }
}

/// Map a node rejection message onto a typed error
pub fn classify_submission_error(chain_id: u64, err: OrchestratorError) -> OrchestratorError {
    let message = match err {
        OrchestratorError::Rpc { message, .. } => message,
        other => return other,
    };

    let lower = message.to_lowercase();
    if lower.contains("nonce too low") {
        OrchestratorError::NonceTooLow { chain_id }
    } else if lower.contains("insufficient funds") {
        OrchestratorError::InsufficientFunds { chain_id }
    } else if lower.contains("underpriced") {
        OrchestratorError::Underpriced { chain_id }
    } else {
        OrchestratorError::Submission(message)
    }
}

fn failure_kind(err: &OrchestratorError) -> &'static str {
    match err {
        OrchestratorError::NonceTooLow { .. } => "nonce_too_low",
        OrchestratorError::InsufficientFunds { .. } => "insufficient_funds",
        OrchestratorError::Underpriced { .. } => "underpriced",
        _ => "rejected",
    }
}
