//! End-to-end lifecycle: prepare, submit, watch and settle transactions

use super::receipt::ReceiptWatcher;
use super::reconciler::{MergeOutcome, TransactionStatusReconciler};
use crate::chain::ChainManager;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorContext, OrchestratorError, OrchestratorResult};
use crate::orders::{OrderApi, OrderStatusWatcher};
use crate::state::{
    persist_guarded, QueuedOrderStatus, TransactionDetails, TransactionKey, TransactionStatus,
    TransactionStore,
};
use crate::tx::{
    NonceCalculator, TransactionPreparationService, TransactionRequest, TransactionSigner,
    TransactionSubmissionService, WalletSigner,
};

use ethers::types::H256;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WRITER: &str = "TransactionLifecycle";

/// Per-call options for [`TransactionLifecycle::execute`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub nonce_override: Option<u64>,
    pub submit_via_private_relay: bool,
}

enum OnChainOutcome {
    Receipt(OrchestratorResult<crate::state::Receipt>),
    Relay(TransactionStatus),
    Superseded(TransactionDetails),
}

/// Wires the services together and owns the order watcher's lifecycle
pub struct TransactionLifecycle {
    store: Arc<dyn TransactionStore>,
    nonces: Arc<NonceCalculator>,
    preparation: TransactionPreparationService,
    submission: TransactionSubmissionService,
    receipts: ReceiptWatcher,
    orders: Arc<OrderStatusWatcher>,
    reconciler: TransactionStatusReconciler,
    clock: Clock,
    watcher_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionLifecycle {
    pub fn new(
        config: &OrchestratorConfig,
        store: Arc<dyn TransactionStore>,
        chains: Arc<ChainManager>,
        signer: Arc<dyn WalletSigner>,
        order_api: Arc<dyn OrderApi>,
    ) -> Self {
        let clock = Clock::new();
        let nonces = Arc::new(NonceCalculator::new(
            chains.clone(),
            store.clone(),
            config.nonce_reservation_ttl(),
        ));
        let signer = Arc::new(TransactionSigner::new(signer, chains.clone()));

        Self {
            preparation: TransactionPreparationService::new(nonces.clone(), signer, clock),
            submission: TransactionSubmissionService::new(chains.clone(), config.submit_timeout()),
            receipts: ReceiptWatcher::new(
                chains,
                config.receipt_timeout(),
                config.receipt_poll_interval(),
                clock,
            ),
            orders: Arc::new(OrderStatusWatcher::new(order_api, store.clone(), config, clock)),
            reconciler: TransactionStatusReconciler::new(
                store.clone(),
                config.reconcile_poll_interval(),
                config.reconcile_timeout(),
            ),
            store,
            nonces,
            clock,
            watcher_handle: Mutex::new(None),
        }
    }

    pub fn preparation(&self) -> &TransactionPreparationService {
        &self.preparation
    }

    pub fn submission(&self) -> &TransactionSubmissionService {
        &self.submission
    }

    pub fn receipts(&self) -> &ReceiptWatcher {
        &self.receipts
    }

    pub fn orders(&self) -> &Arc<OrderStatusWatcher> {
        &self.orders
    }

    pub fn reconciler(&self) -> &TransactionStatusReconciler {
        &self.reconciler
    }

    /// Start the order watcher for a new generation; a previous loop, if any,
    /// stops on its next tick
    pub async fn start(&self) {
        let handle = self.orders.start();
        if let Some(previous) = self.watcher_handle.lock().await.replace(handle) {
            debug!("Replaced order watcher task (finished: {})", previous.is_finished());
        }
    }

    pub async fn stop(&self) {
        self.orders.stop();
        if let Some(handle) = self.watcher_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Order watcher task failed: {}", e);
            }
        }
        info!("Transaction lifecycle stopped");
    }

    /// Persist a record created by the caller, e.g. an order before it is sent
    pub async fn track(&self, details: TransactionDetails) -> OrchestratorResult<TransactionDetails> {
        persist_guarded(self.store.as_ref(), details, WRITER).await
    }

    /// Sign, record and broadcast an on-chain transaction.
    ///
    /// The record is stored as Pending with its nonce before broadcast so
    /// concurrent preparations see it. A rejected broadcast marks the record
    /// failed; a timed-out broadcast leaves it Pending for the watchers.
    pub async fn execute(
        &self,
        mut details: TransactionDetails,
        request: TransactionRequest,
        options: ExecuteOptions,
    ) -> OrchestratorResult<TransactionDetails> {
        let account = details.from;
        let chain_id = details.chain_id;

        // A settled record never gets a second broadcast under the same id
        if let Some(stored) = self.store.get(&details.key()).await? {
            if stored.status.is_terminal() {
                return Err(already_settled(&stored));
            }
        }

        let signed = self
            .preparation
            .prepare_and_sign(
                account,
                chain_id,
                request,
                options.nonce_override,
                options.submit_via_private_relay,
            )
            .await?;
        let nonce = signed.nonce;

        details.status = TransactionStatus::Pending;
        details.hash = Some(signed.hash);
        details.options.nonce = Some(nonce);
        details.options.submit_via_private_rpc = options.submit_via_private_relay;
        details.options.time_signed_ms = Some(signed.time_signed_ms);
        details.options.signing_latency_ms = Some(signed.signing_latency_ms());

        let persisted = persist_guarded(self.store.as_ref(), details, WRITER).await;
        // The stored record now carries the nonce, or the attempt is over
        self.nonces.release(account, chain_id, nonce).await;
        let mut details = persisted?;

        // Settled by another writer since the check above; the nonce is unused
        if details.status != TransactionStatus::Pending || details.options.nonce != Some(nonce) {
            warn!(
                "Not broadcasting {}: record settled as {} during preparation",
                details.key(),
                details.status
            );
            return Err(already_settled(&details));
        }

        match self
            .submission
            .submit(signed, options.submit_via_private_relay)
            .await
        {
            Ok(hash) => {
                details.hash = Some(hash);
                details.options.time_submitted_ms = Some(self.clock.now_ms());
                persist_guarded(self.store.as_ref(), details, WRITER).await
            }
            Err(e) if e.is_inconclusive() => {
                warn!(
                    "Broadcast of {} timed out, leaving it pending: {}",
                    details.key(),
                    e
                );
                Err(e)
            }
            Err(e) => {
                details.status = match e.root() {
                    OrchestratorError::InsufficientFunds { .. } => {
                        TransactionStatus::InsufficientFunds
                    }
                    _ => TransactionStatus::Failed,
                };
                if let Err(store_err) =
                    persist_guarded(self.store.as_ref(), details, WRITER).await
                {
                    error!("Failed to record submission failure: {}", store_err);
                }
                Err(e)
            }
        }
    }

    /// Follow a stored transaction until it settles
    pub async fn watch(&self, key: &TransactionKey) -> OrchestratorResult<TransactionDetails> {
        let details = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                tx_id: key.to_string(),
            })?;

        if details.is_order() {
            self.watch_order(details).await
        } else {
            self.watch_on_chain(details).await
        }
    }

    async fn watch_on_chain(
        &self,
        details: TransactionDetails,
    ) -> OrchestratorResult<TransactionDetails> {
        let hash = details
            .hash
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                tx_id: details.key().to_string(),
            })?;

        let outcome = tokio::select! {
            biased;
            receipt = self.receipts.wait_for_receipt(details.chain_id, hash) => {
                OnChainOutcome::Receipt(receipt)
            }
            Some(status) = self.relay_verdict(&details, hash) => OnChainOutcome::Relay(status),
            Some(sibling) = self.wait_for_same_nonce_settled(&details) => {
                OnChainOutcome::Superseded(sibling)
            }
        };

        let receipt = match outcome {
            OnChainOutcome::Receipt(Ok(receipt)) => receipt,
            OnChainOutcome::Receipt(Err(e)) if e.is_inconclusive() => {
                if self.receipts.check_invalidated(&details).await? {
                    info!("Transaction {:?} was dropped, marking failed", hash);
                    let mut failed = self.current(&details).await?;
                    failed.status = TransactionStatus::Failed;
                    return persist_guarded(self.store.as_ref(), failed, WRITER).await;
                }
                return Err(e);
            }
            OnChainOutcome::Receipt(Err(e)) => return Err(e),
            OnChainOutcome::Relay(status) => {
                let mut dropped = self.current(&details).await?;
                dropped.status = status;
                return persist_guarded(self.store.as_ref(), dropped, WRITER).await;
            }
            OnChainOutcome::Superseded(sibling) => {
                info!(
                    "Nonce {:?} of {:?} was used by {}, marking {} failed",
                    details.options.nonce, details.from, sibling.id, details.id
                );
                let mut replaced = self.current(&details).await?;
                replaced.status = TransactionStatus::Failed;
                return persist_guarded(self.store.as_ref(), replaced, WRITER).await;
            }
        };

        let mut settled = self.current(&details).await?;
        settled.status = if receipt.success {
            TransactionStatus::Success
        } else {
            TransactionStatus::Failed
        };
        let settled = persist_guarded(self.store.as_ref(), settled, WRITER).await?;

        self.merge(&settled, receipt).await
    }

    async fn relay_verdict(
        &self,
        details: &TransactionDetails,
        hash: H256,
    ) -> Option<TransactionStatus> {
        if !details.options.submit_via_private_rpc {
            return None;
        }
        self.receipts.wait_for_relay_verdict(details.chain_id, hash).await
    }

    /// Resolves once another record signed with the same nonce has been mined.
    /// Only one transaction per nonce can ever be included.
    async fn wait_for_same_nonce_settled(
        &self,
        details: &TransactionDetails,
    ) -> Option<TransactionDetails> {
        let nonce = details.options.nonce?;

        loop {
            match self.store.find_by_nonce(details.from, details.chain_id, nonce).await {
                Ok(records) => {
                    let sibling = records.into_iter().find(|r| {
                        r.id != details.id
                            && !r.is_order()
                            && r.status.is_terminal()
                            && r.receipt.is_some()
                    });
                    if sibling.is_some() {
                        return sibling;
                    }
                }
                Err(e) => debug!("Same-nonce lookup for {} failed: {}", details.id, e),
            }

            tokio::time::sleep(self.receipts.poll_interval()).await;
        }
    }

    async fn watch_order(
        &self,
        details: TransactionDetails,
    ) -> OrchestratorResult<TransactionDetails> {
        let order_hash = details
            .order_hash
            .clone()
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                tx_id: details.key().to_string(),
            })?;
        let mut queue_status = details.queue_status.unwrap_or(QueuedOrderStatus::Submitted);

        let resolved = loop {
            let resolved = self
                .orders
                .wait_for_order_status(&order_hash, queue_status)
                .await?;

            let still_queued = matches!(
                resolved.queue_status,
                None | Some(QueuedOrderStatus::Submitted) | Some(QueuedOrderStatus::Waiting)
            );
            if resolved.status.is_terminal() || !still_queued {
                break resolved;
            }
            debug!("Order {} now {}, waiting again", order_hash, resolved.status);
            queue_status = resolved.queue_status.unwrap_or(QueuedOrderStatus::Submitted);
        };

        match (resolved.status, resolved.hash) {
            (TransactionStatus::Success, Some(fill_hash)) => {
                match self.receipts.wait_for_receipt(resolved.chain_id, fill_hash).await {
                    Ok(receipt) => self.merge(&resolved, receipt).await,
                    Err(e) => {
                        warn!("No receipt for fill of order {}: {}", order_hash, e);
                        Ok(resolved)
                    }
                }
            }
            _ => Ok(resolved),
        }
    }

    async fn merge(
        &self,
        details: &TransactionDetails,
        receipt: crate::state::Receipt,
    ) -> OrchestratorResult<TransactionDetails> {
        let fee = self.receipts.network_fee(details.chain_id, &receipt)?;
        match self.reconciler.merge_receipt(&details.key(), receipt, fee).await? {
            MergeOutcome::Merged(merged) => Ok(merged),
            MergeOutcome::Abandoned | MergeOutcome::Missing => self.current(details).await,
        }
    }

    /// The stored version of the record, falling back to the given copy
    async fn current(&self, details: &TransactionDetails) -> OrchestratorResult<TransactionDetails> {
        Ok(self
            .store
            .get(&details.key())
            .await?
            .unwrap_or_else(|| details.clone()))
    }

    /// Resume watching every record left incomplete by a previous run.
    ///
    /// Orders that never left the local queue cannot be sent any more and are
    /// marked as closed with the app instead.
    pub async fn resume_incomplete(self: &Arc<Self>) -> OrchestratorResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for details in self.store.incomplete().await? {
            if details.is_order() {
                match details.queue_status {
                    Some(QueuedOrderStatus::Waiting) => {
                        let mut closed = details;
                        closed.queue_status = Some(QueuedOrderStatus::AppClosed);
                        info!("Order {} closed before submission", closed.key());
                        persist_guarded(self.store.as_ref(), closed, WRITER).await?;
                        continue;
                    }
                    Some(QueuedOrderStatus::Submitted) | None => {}
                    Some(_) => continue,
                }
            } else if details.hash.is_none() {
                debug!("Skipping {}: never broadcast", details.key());
                continue;
            }

            let key = details.key();
            let lifecycle = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                match lifecycle.watch(&key).await {
                    Ok(settled) => debug!("Resumed {} settled as {}", key, settled.status),
                    Err(e) => warn!("Resumed watch of {} ended: {}", key, e),
                }
            }));
        }

        info!("Resumed {} incomplete transactions", handles.len());
        Ok(handles)
    }
}

fn already_settled(details: &TransactionDetails) -> OrchestratorError {
    OrchestratorError::AlreadySettled {
        tx_id: details.key().to_string(),
        status: details.status.to_string(),
    }
    .tagged(ErrorContext::new(WRITER, "execute").chain(details.chain_id).account(details.from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{GasPrice, MockChainRpc, NativeCurrency, RelayStatus};
    use crate::state::Receipt;
    use crate::orders::{MockOrderApi, RemoteOrder, RemoteOrderStatus};
    use crate::state::MemoryStore;
    use crate::test_util::{self, test_signer};
    use async_trait::async_trait;
    use ethers::types::{Address, H256, U256};
    use std::sync::atomic::{AtomicBool, Ordering};
    use ethers::utils::keccak256;

    fn chain_rpc() -> MockChainRpc {
        let mut rpc = MockChainRpc::new();
        rpc.expect_chain_id().return_const(1u64);
        rpc.expect_get_transaction_count().returning(|_| Ok(4));
        rpc.expect_supports_private_relay().return_const(true);
        rpc.expect_native_currency().returning(|| NativeCurrency {
            symbol: "ETH".into(),
            address: "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee".into(),
        });
        rpc
    }

    fn lifecycle(
        rpc: MockChainRpc,
        api: MockOrderApi,
        store: Arc<dyn TransactionStore>,
    ) -> Arc<TransactionLifecycle> {
        Arc::new(TransactionLifecycle::new(
            &OrchestratorConfig::default(),
            store,
            Arc::new(ChainManager::from_providers(vec![Arc::new(rpc)])),
            test_signer(),
            Arc::new(api),
        ))
    }

    fn request(from: Address) -> TransactionRequest {
        TransactionRequest::new(1, from)
            .to(Address::repeat_byte(0x42))
            .value(1_000u64)
            .gas_limit(21_000u64)
            .fees(GasPrice::Legacy(U256::from(1_000_000_000u64)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_then_watch_to_success() {
        let from = test_signer().address();
        let store = Arc::new(MemoryStore::new());

        let mut rpc = chain_rpc();
        rpc.expect_send_raw_transaction()
            .times(1)
            .returning(|raw, private| {
                assert!(private);
                Ok(H256::from(keccak256(&raw)))
            });
        rpc.expect_get_transaction_receipt()
            .returning(|hash| Ok(Some(test_util::mined_receipt(hash, true))));
        rpc.expect_private_relay_status()
            .returning(|_| Ok(RelayStatus::Included));

        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());
        let details = test_util::swap(from, 1, 0);

        let submitted = lifecycle
            .execute(
                details.clone(),
                request(from),
                ExecuteOptions {
                    nonce_override: None,
                    submit_via_private_relay: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(submitted.status, TransactionStatus::Pending);
        assert_eq!(submitted.options.nonce, Some(4));
        assert!(submitted.options.submit_via_private_rpc);
        assert!(submitted.options.time_submitted_ms.is_some());
        assert!(submitted.hash.is_some());
        assert_eq!(lifecycle.nonces.reserved_count(from, 1).await, 0);

        let settled = lifecycle.watch(&details.key()).await.unwrap();
        assert_eq!(settled.status, TransactionStatus::Success);
        assert_eq!(
            settled.network_fee.as_ref().map(|f| f.quantity.clone()),
            Some((U256::from(21_000) * U256::from(2_000_000_000u64)).to_string())
        );
        assert_eq!(store.get(&details.key()).await.unwrap(), Some(settled));
    }

    #[tokio::test]
    async fn test_rejected_broadcast_marks_record() {
        let from = test_signer().address();
        let store = Arc::new(MemoryStore::new());

        let mut rpc = chain_rpc();
        rpc.expect_send_raw_transaction().returning(|_, _| {
            Err(OrchestratorError::Rpc {
                chain_id: 1,
                message: "insufficient funds for gas * price + value".into(),
            })
        });

        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());
        let details = test_util::swap(from, 1, 0);

        let err = lifecycle
            .execute(details.clone(), request(from), ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), OrchestratorError::InsufficientFunds { chain_id: 1 }));
        let stored = store.get(&details.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::InsufficientFunds);
        assert_eq!(stored.options.nonce, Some(4));
    }

    #[tokio::test]
    async fn test_user_rejection_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(chain_rpc(), MockOrderApi::new(), store.clone());

        // Request from an account the signer does not hold
        let stranger = Address::repeat_byte(0x77);
        let err = lifecycle
            .execute(
                test_util::swap(stranger, 1, 0),
                request(stranger),
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err.root(), OrchestratorError::Signer(_)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filled_order_settles_with_fee() {
        let from = Address::repeat_byte(0x0a);
        let store = Arc::new(MemoryStore::new());
        let fill = H256::repeat_byte(0xde);

        let mut rpc = chain_rpc();
        rpc.expect_get_transaction_receipt()
            .returning(|hash| Ok(Some(test_util::mined_receipt(hash, true))));
        let mut api = MockOrderApi::new();
        api.expect_fetch_orders().returning(move |_| {
            Ok(vec![RemoteOrder {
                order_hash: "0xabc".into(),
                order_status: RemoteOrderStatus::Filled,
                tx_hash: Some(fill),
            }])
        });

        let lifecycle = lifecycle(rpc, api, store.clone());
        lifecycle.start().await;

        let order = lifecycle
            .track(test_util::order(from, 1, "0xabc", 0))
            .await
            .unwrap();

        let watch = tokio::spawn({
            let lifecycle = lifecycle.clone();
            let key = order.key();
            async move { lifecycle.watch(&key).await }
        });
        tokio::task::yield_now().await;
        lifecycle.orders().mark_submitted("0xabc").await.unwrap();

        let settled = watch.await.unwrap().unwrap();
        assert_eq!(settled.status, TransactionStatus::Success);
        assert_eq!(settled.hash, Some(fill));
        assert_eq!(settled.queue_status, Some(QueuedOrderStatus::Submitted));
        assert!(settled.network_fee.is_some());

        lifecycle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_closes_unsent_orders_and_watches_the_rest() {
        let from = Address::repeat_byte(0x0a);
        let store = Arc::new(MemoryStore::new());

        let unsent = test_util::order(from, 1, "0xabc", 0);
        store.upsert(&unsent).await.unwrap();

        let mut pending = test_util::swap(from, 1, 0);
        pending.hash = Some(H256::repeat_byte(0x33));
        store.upsert(&pending).await.unwrap();

        let mut never_sent = test_util::swap(from, 1, 0);
        never_sent.hash = None;
        store.upsert(&never_sent).await.unwrap();

        let mut rpc = chain_rpc();
        rpc.expect_get_transaction_receipt()
            .returning(|hash| Ok(Some(test_util::mined_receipt(hash, false))));

        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());
        let handles = lifecycle.resume_incomplete().await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }

        let closed = store.get(&unsent.key()).await.unwrap().unwrap();
        assert_eq!(closed.queue_status, Some(QueuedOrderStatus::AppClosed));

        let settled = store.get(&pending.key()).await.unwrap().unwrap();
        assert_eq!(settled.status, TransactionStatus::Failed);
        assert!(settled.receipt.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_public_transaction_marked_failed_after_timeout() {
        let from = Address::repeat_byte(0x0a);
        let store = Arc::new(MemoryStore::new());
        let mut pending = test_util::swap(from, 1, 0);
        pending.hash = Some(H256::repeat_byte(0x44));
        store.upsert(&pending).await.unwrap();

        let mut rpc = chain_rpc();
        rpc.expect_get_transaction_receipt().returning(|_| Ok(None));
        rpc.expect_transaction_exists().returning(|_| Ok(false));

        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());
        let settled = lifecycle.watch(&pending.key()).await.unwrap();

        assert_eq!(settled.status, TransactionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_failure_settles_before_receipt_timeout() {
        let from = Address::repeat_byte(0x0a);
        let store = Arc::new(MemoryStore::new());
        let mut pending = test_util::swap(from, 1, 0);
        pending.hash = Some(H256::repeat_byte(0x45));
        pending.options.nonce = Some(4);
        pending.options.submit_via_private_rpc = true;
        store.upsert(&pending).await.unwrap();

        let mut rpc = chain_rpc();
        rpc.expect_get_transaction_receipt().returning(|_| Ok(None));
        let mut lookups = 0;
        rpc.expect_private_relay_status().returning(move |_| {
            lookups += 1;
            Ok(if lookups < 2 {
                RelayStatus::Pending
            } else {
                RelayStatus::Failed {
                    reason: Some("bundle simulation reverted".into()),
                }
            })
        });
        rpc.expect_transaction_exists().never();

        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());
        let started = tokio::time::Instant::now();
        let settled = lifecycle.watch(&pending.key()).await.unwrap();

        assert_eq!(settled.status, TransactionStatus::Failed);
        assert!(settled.receipt.is_none());
        assert!(started.elapsed() < OrchestratorConfig::default().receipt_timeout());
        assert_eq!(store.get(&pending.key()).await.unwrap(), Some(settled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mined_sibling_with_same_nonce_fails_the_other() {
        let from = Address::repeat_byte(0x0a);
        let store = Arc::new(MemoryStore::new());

        let mut speed_up = test_util::swap(from, 1, 0);
        speed_up.hash = Some(H256::repeat_byte(0x51));
        speed_up.options.nonce = Some(5);
        speed_up.status = TransactionStatus::Success;
        speed_up.receipt = Some(Receipt::from_ethers(
            &test_util::mined_receipt(H256::repeat_byte(0x51), true),
            0,
        ));
        store.upsert(&speed_up).await.unwrap();

        let mut original = test_util::swap(from, 1, 0);
        original.hash = Some(H256::repeat_byte(0x52));
        original.options.nonce = Some(5);
        store.upsert(&original).await.unwrap();

        let mut rpc = chain_rpc();
        rpc.expect_get_transaction_receipt().returning(|_| Ok(None));
        rpc.expect_transaction_exists().never();

        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());
        let settled = lifecycle.watch(&original.key()).await.unwrap();

        assert_eq!(settled.status, TransactionStatus::Failed);
        assert!(settled.receipt.is_none());
        assert_eq!(
            store.get(&speed_up.key()).await.unwrap().map(|d| d.status),
            Some(TransactionStatus::Success)
        );
    }

    #[tokio::test]
    async fn test_settled_record_is_not_broadcast_again() {
        let from = test_signer().address();
        let store = Arc::new(MemoryStore::new());
        let mut failed = test_util::swap(from, 1, 0);
        failed.status = TransactionStatus::Failed;
        store.upsert(&failed).await.unwrap();

        let mut rpc = chain_rpc();
        rpc.expect_send_raw_transaction().never();
        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());

        let err = lifecycle
            .execute(failed.clone(), request(from), ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), OrchestratorError::AlreadySettled { .. }));
        assert_eq!(store.get(&failed.key()).await.unwrap(), Some(failed));
        assert_eq!(lifecycle.nonces.reserved_count(from, 1).await, 0);
    }

    /// Hides the stored record from the first lookup, as if another writer
    /// settled it while the transaction was being signed
    struct SettlesDuringPreparation {
        inner: MemoryStore,
        hidden: AtomicBool,
    }

    #[async_trait]
    impl TransactionStore for SettlesDuringPreparation {
        async fn get(&self, key: &TransactionKey) -> OrchestratorResult<Option<TransactionDetails>> {
            if self.hidden.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get(key).await
        }

        async fn upsert(&self, details: &TransactionDetails) -> OrchestratorResult<()> {
            self.inner.upsert(details).await
        }

        async fn find_by_order_hash(
            &self,
            order_hash: &str,
        ) -> OrchestratorResult<Option<TransactionDetails>> {
            self.inner.find_by_order_hash(order_hash).await
        }

        async fn pending_for_account(
            &self,
            address: Address,
            chain_id: u64,
        ) -> OrchestratorResult<Vec<TransactionDetails>> {
            self.inner.pending_for_account(address, chain_id).await
        }

        async fn incomplete(&self) -> OrchestratorResult<Vec<TransactionDetails>> {
            self.inner.incomplete().await
        }

        async fn find_by_nonce(
            &self,
            address: Address,
            chain_id: u64,
            nonce: u64,
        ) -> OrchestratorResult<Vec<TransactionDetails>> {
            self.inner.find_by_nonce(address, chain_id, nonce).await
        }
    }

    #[tokio::test]
    async fn test_record_settled_while_signing_is_not_broadcast() {
        let from = test_signer().address();
        let store = Arc::new(SettlesDuringPreparation {
            inner: MemoryStore::new(),
            hidden: AtomicBool::new(true),
        });
        let mut failed = test_util::swap(from, 1, 0);
        failed.status = TransactionStatus::Failed;
        store.upsert(&failed).await.unwrap();

        let mut rpc = chain_rpc();
        rpc.expect_send_raw_transaction().never();
        let lifecycle = lifecycle(rpc, MockOrderApi::new(), store.clone());

        let err = lifecycle
            .execute(failed.clone(), request(from), ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), OrchestratorError::AlreadySettled { .. }));
        let stored = store.get(&failed.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.options.nonce, None);

        // The nonce the aborted attempt signed with is handed out again
        let next = lifecycle
            .preparation()
            .prepare_and_sign(from, 1, request(from), None, false)
            .await
            .unwrap();
        assert_eq!(next.nonce, 4);
    }
}
