//! In-process transaction store

use super::{TransactionDetails, TransactionKey, TransactionStore};
use crate::error::OrchestratorResult;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;

/// Store backed by a concurrent map; contents live as long as the process
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<TransactionKey, TransactionDetails>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn get(&self, key: &TransactionKey) -> OrchestratorResult<Option<TransactionDetails>> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn upsert(&self, details: &TransactionDetails) -> OrchestratorResult<()> {
        self.records.insert(details.key(), details.clone());
        Ok(())
    }

    async fn find_by_order_hash(
        &self,
        order_hash: &str,
    ) -> OrchestratorResult<Option<TransactionDetails>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.order_hash.as_deref() == Some(order_hash))
            .map(|r| r.value().clone()))
    }

    async fn pending_for_account(
        &self,
        address: Address,
        chain_id: u64,
    ) -> OrchestratorResult<Vec<TransactionDetails>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.from == address && r.chain_id == chain_id && r.status.is_temporary())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn incomplete(&self) -> OrchestratorResult<Vec<TransactionDetails>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status.is_temporary())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn find_by_nonce(
        &self,
        address: Address,
        chain_id: u64,
        nonce: u64,
    ) -> OrchestratorResult<Vec<TransactionDetails>> {
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.from == address && r.chain_id == chain_id && r.options.nonce == Some(nonce)
            })
            .map(|r| r.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{TransactionStatus, TransactionTypeInfo};

    fn approve(from: Address, chain_id: u64, status: TransactionStatus) -> TransactionDetails {
        let mut details = TransactionDetails::new(
            from,
            chain_id,
            TransactionTypeInfo::Approve {
                token_address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
                spender: Address::repeat_byte(0x22),
            },
            0,
        );
        details.status = status;
        details
    }

    #[tokio::test]
    async fn test_pending_for_account_filters_account_chain_and_status() {
        let store = MemoryStore::new();
        let alice = Address::repeat_byte(0x01);
        let bob = Address::repeat_byte(0x02);

        store.upsert(&approve(alice, 1, TransactionStatus::Pending)).await.unwrap();
        store.upsert(&approve(alice, 1, TransactionStatus::Cancelling)).await.unwrap();
        store.upsert(&approve(alice, 1, TransactionStatus::Success)).await.unwrap();
        store.upsert(&approve(alice, 10, TransactionStatus::Pending)).await.unwrap();
        store.upsert(&approve(bob, 1, TransactionStatus::Pending)).await.unwrap();

        let pending = store.pending_for_account(alice, 1).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(store.incomplete().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_find_by_order_hash() {
        let store = MemoryStore::new();
        let mut order = approve(Address::repeat_byte(0x01), 1, TransactionStatus::Pending);
        order.order_hash = Some("0xabc".into());
        store.upsert(&order).await.unwrap();

        assert_eq!(store.find_by_order_hash("0xabc").await.unwrap(), Some(order));
        assert!(store.find_by_order_hash("0xdef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_nonce_ignores_unsigned_and_other_chains() {
        let store = MemoryStore::new();
        let from = Address::repeat_byte(0x01);
        let mut first = approve(from, 1, TransactionStatus::Failed);
        first.options.nonce = Some(7);
        let mut second = approve(from, 1, TransactionStatus::Success);
        second.options.nonce = Some(7);
        let mut elsewhere = approve(from, 10, TransactionStatus::Pending);
        elsewhere.options.nonce = Some(7);
        let unsigned = approve(from, 1, TransactionStatus::Pending);
        for record in [&first, &second, &elsewhere, &unsigned] {
            store.upsert(record).await.unwrap();
        }

        let mut found = store.find_by_nonce(from, 1, 7).await.unwrap();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        let mut expected = vec![first, second];
        expected.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(found, expected);
        assert!(store.find_by_nonce(from, 1, 8).await.unwrap().is_empty());
    }
}
