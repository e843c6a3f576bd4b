//! Transaction preparation and submission with nonce management and gas estimation

mod gas;
mod nonce;
mod prepare;
mod sender;
mod signer;
mod types;

pub use gas::GasEstimator;
pub use nonce::NonceCalculator;
pub use prepare::TransactionPreparationService;
pub use sender::{classify_submission_error, TransactionSubmissionService};
pub use signer::{LocalWalletSigner, SignedPayload, TransactionSigner, WalletSigner};
pub use types::{CalculatedNonce, NonceSource, SignedTransactionRequest, TransactionRequest};

#[cfg(test)]
pub use signer::MockWalletSigner;
