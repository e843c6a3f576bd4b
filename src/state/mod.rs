//! Transaction record persistence
//!
//! Handles:
//! - The durable `TransactionDetails` record model
//! - Store backends (in-memory and PostgreSQL)
//! - Status-monotonic writes shared by every writer

mod details;
mod memory;
mod postgres;

pub use details::{
    NetworkFee, QueuedOrderStatus, Receipt, TransactionDetails, TransactionKey,
    TransactionOptions, TransactionStatus, TransactionTypeInfo,
};
pub use memory::MemoryStore;
pub use postgres::PgTransactionStore;

use crate::error::OrchestratorResult;

use async_trait::async_trait;
use ethers::types::Address;
use tracing::debug;

/// Keyed storage of transaction records. Each upsert is atomic per record.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn get(&self, key: &TransactionKey) -> OrchestratorResult<Option<TransactionDetails>>;

    async fn upsert(&self, details: &TransactionDetails) -> OrchestratorResult<()>;

    async fn find_by_order_hash(
        &self,
        order_hash: &str,
    ) -> OrchestratorResult<Option<TransactionDetails>>;

    /// Records for the account and chain whose status is still temporary
    async fn pending_for_account(
        &self,
        address: Address,
        chain_id: u64,
    ) -> OrchestratorResult<Vec<TransactionDetails>>;

    /// Every record whose status is still temporary
    async fn incomplete(&self) -> OrchestratorResult<Vec<TransactionDetails>>;

    /// Records for the account and chain that were signed with `nonce`
    async fn find_by_nonce(
        &self,
        address: Address,
        chain_id: u64,
        nonce: u64,
    ) -> OrchestratorResult<Vec<TransactionDetails>>;
}

/// Write `update` unless the stored status does not accept the new one (see
/// [`TransactionStatus::accepts`]). Returns the record as it stands after the
/// call.
pub async fn persist_guarded(
    store: &dyn TransactionStore,
    update: TransactionDetails,
    writer: &'static str,
) -> OrchestratorResult<TransactionDetails> {
    if let Some(current) = store.get(&update.key()).await? {
        if !current.status.accepts(update.status) {
            debug!(
                "{} dropped update {} -> {} for {}: stored status takes precedence",
                writer,
                current.status,
                update.status,
                update.key()
            );
            crate::metrics::record_stale_update(writer);
            return Ok(current);
        }
    }

    store.upsert(&update).await?;
    Ok(update)
}
