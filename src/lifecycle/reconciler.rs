//! Attaches receipt data to records whose status is already settled

use crate::state::{
    persist_guarded, NetworkFee, Receipt, TransactionDetails, TransactionKey, TransactionStatus,
    TransactionStore,
};
use crate::error::OrchestratorResult;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const WRITER: &str = "TransactionStatusReconciler";

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Receipt and fee written; status untouched
    Merged(TransactionDetails),
    /// Status stayed Pending for the whole wait; nothing written
    Abandoned,
    /// No record under the key
    Missing,
}

pub struct TransactionStatusReconciler {
    store: Arc<dyn TransactionStore>,
    poll_interval: Duration,
    timeout: Duration,
}

impl TransactionStatusReconciler {
    pub fn new(store: Arc<dyn TransactionStore>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            poll_interval,
            timeout,
        }
    }

    /// Wait for the stored status to leave Pending, then attach the receipt
    /// and fee to the record as it stands.
    pub async fn merge_receipt(
        &self,
        key: &TransactionKey,
        receipt: Receipt,
        network_fee: NetworkFee,
    ) -> OrchestratorResult<MergeOutcome> {
        let deadline = Instant::now() + self.timeout;

        let mut current = loop {
            match self.store.get(key).await? {
                None => return Ok(MergeOutcome::Missing),
                Some(details) if details.status != TransactionStatus::Pending => break details,
                Some(_) => {}
            }

            if Instant::now() + self.poll_interval > deadline {
                warn!(
                    "Status of {} still pending after {:?}, skipping fee merge",
                    key, self.timeout
                );
                crate::metrics::record_reconcile("abandoned");
                return Ok(MergeOutcome::Abandoned);
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        current.receipt = Some(receipt);
        current.network_fee = Some(network_fee);
        let merged = persist_guarded(self.store.as_ref(), current, WRITER).await?;

        debug!("Merged receipt into {} ({})", key, merged.status);
        crate::metrics::record_reconcile("merged");
        Ok(MergeOutcome::Merged(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::test_util;
    use ethers::types::{Address, H256, U256};

    fn receipt() -> Receipt {
        Receipt {
            transaction_hash: H256::repeat_byte(1),
            block_hash: None,
            block_number: Some(10),
            transaction_index: 0,
            gas_used: U256::from(21_000),
            effective_gas_price: U256::from(3),
            success: true,
            confirmed_time: 0,
        }
    }

    fn fee() -> NetworkFee {
        NetworkFee {
            quantity: "63000".into(),
            token_symbol: "ETH".into(),
            token_address: "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee".into(),
            chain_id: 1,
        }
    }

    fn reconciler(store: Arc<MemoryStore>) -> TransactionStatusReconciler {
        TransactionStatusReconciler::new(store, Duration::from_millis(100), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_merges_once_status_leaves_pending() {
        let store = Arc::new(MemoryStore::new());
        let details = test_util::swap(Address::repeat_byte(1), 1, 0);
        store.upsert(&details).await.unwrap();

        let updater = tokio::spawn({
            let store = store.clone();
            let mut settled = details.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1_250)).await;
                settled.status = TransactionStatus::Success;
                store.upsert(&settled).await.unwrap();
            }
        });

        let outcome = reconciler(store.clone())
            .merge_receipt(&details.key(), receipt(), fee())
            .await
            .unwrap();
        updater.await.unwrap();

        let stored = store.get(&details.key()).await.unwrap().unwrap();
        assert_eq!(outcome, MergeOutcome::Merged(stored.clone()));
        assert_eq!(stored.status, TransactionStatus::Success);
        assert_eq!(stored.network_fee, Some(fee()));
        assert_eq!(stored.receipt, Some(receipt()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_after_timeout_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let details = test_util::swap(Address::repeat_byte(1), 1, 0);
        store.upsert(&details).await.unwrap();

        let started = Instant::now();
        let outcome = reconciler(store.clone())
            .merge_receipt(&details.key(), receipt(), fee())
            .await
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Abandoned);
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert!(started.elapsed() >= Duration::from_millis(4_900));
        assert_eq!(store.get(&details.key()).await.unwrap(), Some(details));
    }

    #[tokio::test]
    async fn test_terminal_status_preserved() {
        let store = Arc::new(MemoryStore::new());
        let mut details = test_util::swap(Address::repeat_byte(1), 1, 0);
        details.status = TransactionStatus::Canceled;
        store.upsert(&details).await.unwrap();

        let outcome = reconciler(store.clone())
            .merge_receipt(&details.key(), receipt(), fee())
            .await
            .unwrap();

        match outcome {
            MergeOutcome::Merged(merged) => assert_eq!(merged.status, TransactionStatus::Canceled),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = Arc::new(MemoryStore::new());
        let details = test_util::swap(Address::repeat_byte(1), 1, 0);

        let outcome = reconciler(store)
            .merge_receipt(&details.key(), receipt(), fee())
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Missing);
    }
}
