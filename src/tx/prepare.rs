//! Prepare-and-sign: nonce resolution followed by signing with timing capture

use super::nonce::NonceCalculator;
use super::signer::TransactionSigner;
use super::types::{SignedTransactionRequest, TransactionRequest};
use crate::clock::Clock;
use crate::error::{ErrorContext, OrchestratorError, OrchestratorResult};

use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TransactionPreparationService {
    nonces: Arc<NonceCalculator>,
    signer: Arc<TransactionSigner>,
    clock: Clock,
}

impl TransactionPreparationService {
    pub fn new(nonces: Arc<NonceCalculator>, signer: Arc<TransactionSigner>, clock: Clock) -> Self {
        Self {
            nonces,
            signer,
            clock,
        }
    }

    /// Resolve the nonce, populate the request and sign it.
    ///
    /// Nonce precedence is `nonce_override`, then a nonce already on the
    /// request, then the [`NonceCalculator`]. A failed calculation is not
    /// fatal: the signer's population path asks the chain instead. Errors are
    /// tagged with this service and operation and otherwise left unchanged.
    pub async fn prepare_and_sign(
        &self,
        account: Address,
        chain_id: u64,
        request: TransactionRequest,
        nonce_override: Option<u64>,
        submit_via_private_relay: bool,
    ) -> OrchestratorResult<SignedTransactionRequest> {
        let context = ErrorContext::new("TransactionPreparationService", "prepare_and_sign")
            .chain(chain_id)
            .account(account);

        if request.chain_id != chain_id || request.from != account {
            return Err(OrchestratorError::Internal(format!(
                "Request for {:?} on chain {} does not match {:?} on chain {}",
                request.from, request.chain_id, account, chain_id
            ))
            .tagged(context));
        }

        let (request, reserved) = self
            .resolve_nonce(account, chain_id, request, nonce_override, submit_via_private_relay)
            .await;

        let result = self.populate_and_sign(request).await;
        if result.is_err() {
            if let Some(nonce) = reserved {
                self.nonces.release(account, chain_id, nonce).await;
            }
        }

        result.map_err(|e| e.tagged(context))
    }

    /// Returns the request with its nonce set (when one could be resolved) and
    /// the nonce reserved with the calculator, if any.
    async fn resolve_nonce(
        &self,
        account: Address,
        chain_id: u64,
        mut request: TransactionRequest,
        nonce_override: Option<u64>,
        submit_via_private_relay: bool,
    ) -> (TransactionRequest, Option<u64>) {
        if let Some(nonce) = nonce_override {
            request.nonce = Some(nonce);
            return (request, None);
        }
        if request.nonce.is_some() {
            return (request, None);
        }

        match self
            .nonces
            .get_next_nonce(account, chain_id, submit_via_private_relay)
            .await
        {
            Ok(calculated) => {
                request.nonce = Some(calculated.nonce);
                (request, Some(calculated.nonce))
            }
            Err(e) => {
                warn!(
                    "Nonce calculation failed for {:?} on chain {}, using provider nonce: {}",
                    account, chain_id, e
                );
                crate::metrics::record_nonce_fallback(chain_id);
                (request, None)
            }
        }
    }

    async fn populate_and_sign(
        &self,
        request: TransactionRequest,
    ) -> OrchestratorResult<SignedTransactionRequest> {
        let request = self.signer.populate(request).await?;
        let nonce = request.nonce.ok_or_else(|| OrchestratorError::Nonce {
            chain_id: request.chain_id,
            message: "Request has no nonce after population".to_string(),
        })?;

        let time_presign_ms = self.clock.now_ms();
        let payload = self.signer.sign(&request).await?;
        let time_signed_ms = self.clock.now_ms();

        let signed = SignedTransactionRequest {
            request,
            signature: payload.signature,
            raw: payload.raw,
            hash: payload.hash,
            nonce,
            time_presign_ms,
            time_signed_ms,
        };

        debug!(
            "Signed {:?} with nonce {} on chain {} in {}ms",
            signed.hash,
            nonce,
            signed.chain_id(),
            signed.signing_latency_ms()
        );
        crate::metrics::record_tx_prepared(
            signed.chain_id(),
            signed.signing_latency_ms() as f64 / 1000.0,
        );

        Ok(signed)
    }
}
