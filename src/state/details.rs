//! Durable per-transaction record and its status model

use ethers::types::{Address, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a wallet transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[serde(rename = "cancelled")]
    Canceled,
    #[serde(rename = "cancelling")]
    Cancelling,
    #[serde(rename = "failedCancel")]
    FailedCancel,
    #[serde(rename = "confirmed")]
    Success,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "replacing")]
    Replacing,
    #[serde(rename = "expired")]
    Expired,
    #[serde(rename = "insufficientFunds")]
    InsufficientFunds,
    #[serde(rename = "unknown")]
    Unknown,
}

impl TransactionStatus {
    /// No transition leaves a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Success
                | TransactionStatus::Failed
                | TransactionStatus::Canceled
                | TransactionStatus::Expired
                | TransactionStatus::InsufficientFunds
        )
    }

    /// Whether a stored record in this status may be overwritten with `next`.
    /// Terminal statuses only accept themselves; a pending cancellation only
    /// gives way to a final outcome or a failed cancel.
    pub fn accepts(self, next: TransactionStatus) -> bool {
        if self.is_terminal() {
            return next == self;
        }
        match self {
            TransactionStatus::Cancelling => {
                next.is_terminal()
                    || matches!(
                        next,
                        TransactionStatus::Cancelling | TransactionStatus::FailedCancel
                    )
            }
            _ => true,
        }
    }

    /// Statuses that are still waiting on the chain or settlement backend
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Replacing | TransactionStatus::Cancelling
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Canceled => "cancelled",
            TransactionStatus::Cancelling => "cancelling",
            TransactionStatus::FailedCancel => "failedCancel",
            TransactionStatus::Success => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Replacing => "replacing",
            TransactionStatus::Expired => "expired",
            TransactionStatus::InsufficientFunds => "insufficientFunds",
            TransactionStatus::Unknown => "unknown",
        }
    }

    pub const TEMPORARY: [TransactionStatus; 3] = [
        TransactionStatus::Pending,
        TransactionStatus::Replacing,
        TransactionStatus::Cancelling,
    ];
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local queue state of a batch-auction order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueuedOrderStatus {
    Waiting,
    ApprovalFailed,
    AppClosed,
    Stale,
    SubmissionFailed,
    Submitted,
}

/// Kind-specific payload of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransactionTypeInfo {
    Swap {
        input_currency: String,
        output_currency: String,
        input_amount: String,
        expected_output_amount: String,
    },
    Send {
        recipient: Address,
        token_address: String,
        amount: String,
    },
    Approve {
        token_address: String,
        spender: Address,
    },
    OnRamp {
        provider: String,
    },
    /// Off-chain batch-auction order
    Order {
        input_currency: String,
        output_currency: String,
        input_amount: String,
        expected_output_amount: String,
    },
}

/// Mined transaction receipt as stored on the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: H256,
    pub block_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub transaction_index: u64,
    pub gas_used: U256,
    pub effective_gas_price: U256,
    pub success: bool,
    pub confirmed_time: i64,
}

impl Receipt {
    pub fn from_ethers(receipt: &TransactionReceipt, confirmed_time: i64) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            block_hash: receipt.block_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            transaction_index: receipt.transaction_index.as_u64(),
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt.effective_gas_price.unwrap_or_default(),
            success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            confirmed_time,
        }
    }
}

/// Fee paid for a mined transaction, in the chain's native currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFee {
    /// Wei, decimal string
    pub quantity: String,
    pub token_symbol: String,
    pub token_address: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub nonce: Option<u64>,
    pub submit_via_private_rpc: bool,
    pub time_signed_ms: Option<i64>,
    pub signing_latency_ms: Option<i64>,
    pub time_submitted_ms: Option<i64>,
}

/// Store key: (account, chain, local id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub address: Address,
    pub chain_id: u64,
    pub id: String,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}/{}", self.address, self.chain_id, self.id)
    }
}

/// Durable record kept per transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub id: String,
    pub chain_id: u64,
    pub from: Address,
    pub hash: Option<H256>,
    pub status: TransactionStatus,
    pub type_info: TransactionTypeInfo,
    pub added_time: i64,
    #[serde(default)]
    pub options: TransactionOptions,
    pub receipt: Option<Receipt>,
    pub network_fee: Option<NetworkFee>,
    pub queue_status: Option<QueuedOrderStatus>,
    pub order_hash: Option<String>,
}

impl TransactionDetails {
    /// A new Pending record with a fresh local id
    pub fn new(from: Address, chain_id: u64, type_info: TransactionTypeInfo, added_time: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chain_id,
            from,
            hash: None,
            status: TransactionStatus::Pending,
            type_info,
            added_time,
            options: TransactionOptions::default(),
            receipt: None,
            network_fee: None,
            queue_status: None,
            order_hash: None,
        }
    }

    /// A new Pending batch-auction order waiting to be submitted
    pub fn new_order(
        from: Address,
        chain_id: u64,
        order_hash: impl Into<String>,
        type_info: TransactionTypeInfo,
        added_time: i64,
    ) -> Self {
        let mut details = Self::new(from, chain_id, type_info, added_time);
        details.order_hash = Some(order_hash.into());
        details.queue_status = Some(QueuedOrderStatus::Waiting);
        details
    }

    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            address: self.from,
            chain_id: self.chain_id,
            id: self.id.clone(),
        }
    }

    pub fn is_order(&self) -> bool {
        self.order_hash.is_some() || matches!(self.type_info, TransactionTypeInfo::Order { .. })
    }
}
