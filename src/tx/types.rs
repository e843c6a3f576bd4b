//! Transaction request types passed between preparation and submission

use crate::chain::GasPrice;

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;

/// Unsigned transaction intent
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub chain_id: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub nonce: Option<u64>,
    pub gas_limit: Option<U256>,
    pub fees: Option<GasPrice>,
}

impl TransactionRequest {
    pub fn new(chain_id: u64, from: Address) -> Self {
        Self {
            chain_id,
            from,
            to: None,
            value: U256::zero(),
            data: Bytes::default(),
            nonce: None,
            gas_limit: None,
            fees: None,
        }
    }

    pub fn to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn value(mut self, value: impl Into<U256>) -> Self {
        self.value = value.into();
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn gas_limit(mut self, gas_limit: impl Into<U256>) -> Self {
        self.gas_limit = Some(gas_limit.into());
        self
    }

    pub fn fees(mut self, fees: GasPrice) -> Self {
        self.fees = Some(fees);
        self
    }

    /// Whether nonce, gas limit and fees are all present
    pub fn is_populated(&self) -> bool {
        self.nonce.is_some() && self.gas_limit.is_some() && self.fees.is_some()
    }

    /// Build the ethers transaction; legacy unless EIP-1559 fees are set
    pub fn to_typed(&self) -> TypedTransaction {
        match &self.fees {
            Some(GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }) => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(self.from)
                    .value(self.value)
                    .data(self.data.clone())
                    .chain_id(self.chain_id)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas);
                if let Some(to) = self.to {
                    tx = tx.to(to);
                }
                if let Some(nonce) = self.nonce {
                    tx = tx.nonce(nonce);
                }
                if let Some(gas) = self.gas_limit {
                    tx = tx.gas(gas);
                }
                TypedTransaction::Eip1559(tx)
            }
            fees => {
                let mut tx = ethers::types::TransactionRequest::new()
                    .from(self.from)
                    .value(self.value)
                    .data(self.data.clone())
                    .chain_id(self.chain_id);
                if let Some(GasPrice::Legacy(price)) = fees {
                    tx = tx.gas_price(*price);
                }
                if let Some(to) = self.to {
                    tx = tx.to(to);
                }
                if let Some(nonce) = self.nonce {
                    tx = tx.nonce(nonce);
                }
                if let Some(gas) = self.gas_limit {
                    tx = tx.gas(gas);
                }
                TypedTransaction::Legacy(tx)
            }
        }
    }
}

/// Where a calculated nonce came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSource {
    /// The chain's pending transaction count
    Chain,
    /// Bumped past the chain count by transactions tracked locally
    LocalOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalculatedNonce {
    pub nonce: u64,
    pub source: NonceSource,
}

/// Populated request plus its signature, ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTransactionRequest {
    pub request: TransactionRequest,
    pub signature: Signature,
    /// RLP-encoded signed transaction
    pub raw: Bytes,
    pub hash: H256,
    pub nonce: u64,
    /// Wall-clock ms right before the signer was invoked
    pub time_presign_ms: i64,
    /// Wall-clock ms right after the signer returned
    pub time_signed_ms: i64,
}

impl SignedTransactionRequest {
    pub fn chain_id(&self) -> u64 {
        self.request.chain_id
    }

    pub fn signing_latency_ms(&self) -> i64 {
        self.time_signed_ms - self.time_presign_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_typed_picks_envelope_from_fees() {
        let base = TransactionRequest::new(1, Address::repeat_byte(1))
            .to(Address::repeat_byte(2))
            .value(1_000u64)
            .nonce(7)
            .gas_limit(21_000u64);

        let legacy = base.clone().fees(GasPrice::Legacy(U256::from(30))).to_typed();
        assert!(matches!(legacy, TypedTransaction::Legacy(_)));
        assert_eq!(legacy.gas_price(), Some(U256::from(30)));
        assert_eq!(legacy.nonce(), Some(&U256::from(7)));
        assert_eq!(legacy.chain_id(), Some(U64::from(1)));

        let eip1559 = base
            .fees(GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(50),
                max_priority_fee_per_gas: U256::from(2),
            })
            .to_typed();
        assert!(matches!(eip1559, TypedTransaction::Eip1559(_)));
        assert_eq!(eip1559.gas(), Some(&U256::from(21_000)));
    }

    #[test]
    fn test_to_typed_leaves_request_usable() {
        let request = TransactionRequest::new(1, Address::repeat_byte(1))
            .nonce(3)
            .fees(GasPrice::Legacy(U256::from(9)));

        let first = request.to_typed();
        let second = request.to_typed();
        assert_eq!(first, second);
        assert_eq!(request.fees, Some(GasPrice::Legacy(U256::from(9))));

        let unpriced = TransactionRequest::new(1, Address::repeat_byte(1)).to_typed();
        assert!(matches!(unpriced, TypedTransaction::Legacy(_)));
        assert_eq!(unpriced.gas_price(), None);
    }

    #[test]
    fn test_is_populated() {
        let request = TransactionRequest::new(1, Address::zero()).nonce(1).gas_limit(21_000u64);
        assert!(!request.is_populated());
        assert!(request.fees(GasPrice::Legacy(U256::one())).is_populated());
    }
}
