//! Polling watcher tracking settlement of batch-auction orders
//!
//! One loop per process generation polls the settlement backend for every
//! order that has a waiter. Waiters on the same order hash share a single
//! listener, which is removed as soon as it resolves.

use super::api::{OrderApi, RemoteOrder};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorContext, OrchestratorError, OrchestratorResult};
use crate::state::{persist_guarded, QueuedOrderStatus, TransactionDetails, TransactionStatus, TransactionStore};

use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WRITER: &str = "OrderStatusWatcher";

type Resolution = Shared<oneshot::Receiver<TransactionDetails>>;

struct OrderListener {
    resolve: oneshot::Sender<TransactionDetails>,
    resolution: Resolution,
}

impl OrderListener {
    fn new() -> Self {
        let (resolve, rx) = oneshot::channel();
        Self {
            resolve,
            resolution: rx.shared(),
        }
    }
}

/// What a tick decided for one registered order
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OrderDecision {
    /// Keep polling
    Wait,
    /// Stop polling; waiters get the local record unchanged
    Release(TransactionDetails),
    /// Persist the update, then hand it to waiters
    Resolve(TransactionDetails),
}

/// Decide what one tick does with an order given its local record and the
/// backend's view of it.
pub(crate) fn reconcile_order(
    local: &TransactionDetails,
    remote: Option<&RemoteOrder>,
    now_ms: i64,
    submission_buffer_ms: i64,
) -> OrderDecision {
    if local.queue_status == Some(QueuedOrderStatus::SubmissionFailed) || local.status.is_terminal()
    {
        return OrderDecision::Release(local.clone());
    }

    let remote = match remote {
        Some(remote) => remote,
        None if now_ms - local.added_time > submission_buffer_ms => {
            let mut failed = local.clone();
            failed.queue_status = Some(QueuedOrderStatus::SubmissionFailed);
            failed.status = TransactionStatus::Failed;
            return OrderDecision::Resolve(failed);
        }
        None => return OrderDecision::Wait,
    };

    let status = TransactionStatus::from(remote.order_status);
    if status == local.status {
        return OrderDecision::Wait;
    }
    // Local cancellation intent wins until the backend reports a final state
    if local.status == TransactionStatus::Cancelling && !status.is_terminal() {
        return OrderDecision::Wait;
    }

    let mut updated = local.clone();
    updated.status = status;
    if remote.tx_hash.is_some() {
        updated.hash = remote.tx_hash;
    }
    OrderDecision::Resolve(updated)
}

pub struct OrderStatusWatcher {
    api: Arc<dyn OrderApi>,
    store: Arc<dyn TransactionStore>,
    listeners: DashMap<String, OrderListener>,
    generation: AtomicU64,
    /// Queue status changes, keyed by order hash
    queue_updates: broadcast::Sender<(String, QueuedOrderStatus)>,
    clock: Clock,
    poll_interval: Duration,
    submission_buffer_ms: i64,
}

impl OrderStatusWatcher {
    pub fn new(
        api: Arc<dyn OrderApi>,
        store: Arc<dyn TransactionStore>,
        config: &OrchestratorConfig,
        clock: Clock,
    ) -> Self {
        let (queue_updates, _) = broadcast::channel(256);
        Self {
            api,
            store,
            listeners: DashMap::new(),
            generation: AtomicU64::new(0),
            queue_updates,
            clock,
            poll_interval: config.order_poll_interval(),
            submission_buffer_ms: config.order_submission_buffer_ms as i64,
        }
    }

    /// Start a new polling generation. Any loop from an earlier generation
    /// exits at its next tick.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let watcher = Arc::clone(self);

        info!("Order status watcher generation {} started", generation);
        tokio::spawn(async move {
            loop {
                if watcher.generation.load(Ordering::SeqCst) != generation {
                    debug!("Order status watcher generation {} superseded", generation);
                    break;
                }

                if let Err(e) = watcher.tick().await {
                    warn!("Order status tick failed: {}", e);
                    crate::metrics::record_order_tick_failure();
                }

                tokio::time::sleep(watcher.poll_interval).await;
            }
        })
    }

    /// End the current generation without starting another
    pub fn stop(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        info!("Order status watcher generation {} stopped", generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_watching(&self, order_hash: &str) -> bool {
        self.listeners.contains_key(order_hash)
    }

    /// Record a new queue status on the order and wake anyone waiting for it
    pub async fn update_queue_status(
        &self,
        order_hash: &str,
        queue_status: QueuedOrderStatus,
    ) -> OrchestratorResult<TransactionDetails> {
        let mut details = self
            .store
            .find_by_order_hash(order_hash)
            .await?
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                tx_id: order_hash.to_string(),
            })?;

        details.queue_status = Some(queue_status);
        let details = persist_guarded(self.store.as_ref(), details, WRITER).await?;

        // No receivers is fine
        let _ = self
            .queue_updates
            .send((order_hash.to_string(), queue_status));
        Ok(details)
    }

    /// Signal that the order reached the settlement backend
    pub async fn mark_submitted(&self, order_hash: &str) -> OrchestratorResult<TransactionDetails> {
        self.update_queue_status(order_hash, QueuedOrderStatus::Submitted)
            .await
    }

    /// Wait until the watcher resolves the order.
    ///
    /// Orders not yet submitted are not polled: the call first waits for a
    /// queue status update. If that update is a failure, the current record is
    /// returned without polling.
    pub async fn wait_for_order_status(
        &self,
        order_hash: &str,
        queue_status: QueuedOrderStatus,
    ) -> OrchestratorResult<TransactionDetails> {
        let context = ErrorContext::new(WRITER, "wait_for_order_status");

        if queue_status != QueuedOrderStatus::Submitted {
            match self
                .wait_for_submission(order_hash)
                .await
                .map_err(|e| e.tagged(context.clone()))?
            {
                QueuedOrderStatus::Submitted => {}
                _ => {
                    return self
                        .store
                        .find_by_order_hash(order_hash)
                        .await
                        .and_then(|d| {
                            d.ok_or_else(|| OrchestratorError::TransactionNotFound {
                                tx_id: order_hash.to_string(),
                            })
                        })
                        .map_err(|e| e.tagged(context));
                }
            }
        }

        let resolution = self
            .listeners
            .entry(order_hash.to_string())
            .or_insert_with(|| {
                debug!("Watching order {}", order_hash);
                OrderListener::new()
            })
            .resolution
            .clone();

        resolution.await.map_err(|_| {
            OrchestratorError::ListenerDropped {
                order_hash: order_hash.to_string(),
            }
            .tagged(context)
        })
    }

    /// Block until the order leaves the Waiting queue state
    async fn wait_for_submission(&self, order_hash: &str) -> OrchestratorResult<QueuedOrderStatus> {
        let mut updates = self.queue_updates.subscribe();

        // The update may have landed before we subscribed
        if let Some(status) = self.stored_queue_status(order_hash).await? {
            return Ok(status);
        }

        loop {
            match updates.recv().await {
                Ok((hash, status)) if hash == order_hash && status != QueuedOrderStatus::Waiting => {
                    return Ok(status);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(status) = self.stored_queue_status(order_hash).await? {
                        return Ok(status);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(OrchestratorError::ListenerDropped {
                        order_hash: order_hash.to_string(),
                    });
                }
            }
        }
    }

    /// Stored queue status, unless the order is still waiting to be sent
    async fn stored_queue_status(
        &self,
        order_hash: &str,
    ) -> OrchestratorResult<Option<QueuedOrderStatus>> {
        Ok(self
            .store
            .find_by_order_hash(order_hash)
            .await?
            .and_then(|d| d.queue_status)
            .filter(|s| *s != QueuedOrderStatus::Waiting))
    }

    /// One polling pass over every registered order
    pub async fn tick(&self) -> OrchestratorResult<()> {
        let hashes: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        if hashes.is_empty() {
            return Ok(());
        }

        let remote = self.api.fetch_orders(&hashes).await?;
        let remote: HashMap<&str, &RemoteOrder> = remote
            .iter()
            .map(|order| (order.order_hash.as_str(), order))
            .collect();
        let now_ms = self.clock.now_ms();

        for hash in &hashes {
            let local = match self.store.find_by_order_hash(hash).await? {
                Some(local) => local,
                None => continue,
            };

            match reconcile_order(
                &local,
                remote.get(hash.as_str()).copied(),
                now_ms,
                self.submission_buffer_ms,
            ) {
                OrderDecision::Wait => {}
                OrderDecision::Release(local) => {
                    debug!("Order {} no longer needs polling ({})", hash, local.status);
                    self.resolve(hash, local);
                }
                OrderDecision::Resolve(updated) => {
                    if updated.queue_status == Some(QueuedOrderStatus::SubmissionFailed) {
                        warn!(
                            "Order {} not seen by the settlement backend after {}ms, marking submission failed",
                            hash, self.submission_buffer_ms
                        );
                        crate::metrics::record_order_submission_inferred_failed();
                    }

                    let intended = updated.status;
                    let stored = persist_guarded(self.store.as_ref(), updated, WRITER).await?;
                    if stored.status != intended && !stored.status.is_terminal() {
                        // Another writer moved the record since it was read
                        debug!(
                            "Order {} kept as {} instead of {}",
                            hash, stored.status, intended
                        );
                        continue;
                    }
                    info!("Order {} resolved as {}", hash, stored.status);
                    crate::metrics::record_order_resolved(stored.status.as_str());
                    self.resolve(hash, stored);
                }
            }
        }

        Ok(())
    }

    fn resolve(&self, order_hash: &str, details: TransactionDetails) {
        if let Some((_, listener)) = self.listeners.remove(order_hash) {
            // Every waiter may already be gone
            let _ = listener.resolve.send(details);
        }
    }
}
