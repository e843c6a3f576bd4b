//! Error types for the wallet transaction orchestrator

use std::fmt;
use thiserror::Error;

/// Diagnostic tag attached to errors raised to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Component that raised the error, e.g. `TransactionPreparationService`
    pub component: &'static str,
    /// Operation within the component, e.g. `prepare_and_sign`
    pub operation: &'static str,
    pub chain_id: Option<u64>,
    pub account: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            chain_id: None,
            account: None,
        }
    }

    pub fn chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn account(mut self, account: impl fmt::Debug) -> Self {
        self.account = Some(format!("{:?}", account));
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.component, self.operation)?;
        if let Some(chain_id) = self.chain_id {
            write!(f, " chain={}", chain_id)?;
        }
        if let Some(ref account) = self.account {
            write!(f, " account={}", account)?;
        }
        Ok(())
    }
}

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RPC error for chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("User rejected request")]
    UserRejected,

    #[error("Nonce too low on chain {chain_id}")]
    NonceTooLow { chain_id: u64 },

    #[error("Insufficient funds on chain {chain_id}")]
    InsufficientFunds { chain_id: u64 },

    #[error("Transaction underpriced on chain {chain_id}")]
    Underpriced { chain_id: u64 },

    #[error("Failed to send transaction: {0}")]
    Submission(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Order API error: {0}")]
    OrderApi(String),

    #[error("Listener for order {order_hash} dropped before resolving")]
    ListenerDropped { order_hash: String },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Transaction {tx_id} is already {status}")]
    AlreadySettled { tx_id: String, status: String },

    #[error("[{context}] {source}")]
    Tagged {
        context: ErrorContext,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Wrap the error with a diagnostic tag. Already tagged errors keep their
    /// innermost tag.
    pub fn tagged(self, context: ErrorContext) -> Self {
        match self {
            OrchestratorError::Tagged { .. } => self,
            other => OrchestratorError::Tagged {
                context,
                source: Box::new(other),
            },
        }
    }

    /// The error as originally raised, with any diagnostic tag removed
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::Tagged { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            OrchestratorError::Tagged { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            OrchestratorError::Rpc { .. }
                | OrchestratorError::Timeout { .. }
                | OrchestratorError::NonceTooLow { .. }
                | OrchestratorError::Underpriced { .. }
        )
    }

    /// A timeout says nothing about the final outcome of the transaction
    pub fn is_inconclusive(&self) -> bool {
        matches!(self.root(), OrchestratorError::Timeout { .. })
    }

    pub fn is_user_rejection(&self) -> bool {
        matches!(self.root(), OrchestratorError::UserRejected)
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
