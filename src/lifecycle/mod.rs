//! Receipt watching, fee reconciliation and the end-to-end transaction flow

mod engine;
mod receipt;
mod reconciler;

pub use engine::{ExecuteOptions, TransactionLifecycle};
pub use receipt::ReceiptWatcher;
pub use reconciler::{MergeOutcome, TransactionStatusReconciler};
