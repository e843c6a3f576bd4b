//! Shared fixtures for unit tests

use crate::chain::{ChainManager, ChainRpc, GasPrice, MockChainRpc, NativeCurrency, RelayStatus};
use crate::error::OrchestratorResult;
use crate::state::{TransactionDetails, TransactionTypeInfo};
use crate::tx::{
    LocalWalletSigner, SignedTransactionRequest, TransactionRequest, TransactionSigner,
    WalletSigner,
};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;

/// First default anvil/hardhat account
pub const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn test_signer() -> Arc<dyn WalletSigner> {
    Arc::new(LocalWalletSigner::from_key(TEST_KEY).unwrap())
}

pub async fn signed_request(chain_id: u64, nonce: u64) -> SignedTransactionRequest {
    let signer = test_signer();
    let from = signer.address();
    let tx_signer = TransactionSigner::new(signer, Arc::new(ChainManager::from_providers(vec![])));
    let request = TransactionRequest::new(chain_id, from)
        .to(Address::repeat_byte(0x42))
        .nonce(nonce)
        .gas_limit(21_000u64)
        .fees(GasPrice::Legacy(U256::from(1_000_000_000u64)));
    let payload = tx_signer.sign(&request).await.unwrap();

    SignedTransactionRequest {
        request,
        signature: payload.signature,
        raw: payload.raw,
        hash: payload.hash,
        nonce,
        time_presign_ms: 0,
        time_signed_ms: 0,
    }
}

pub fn swap(from: Address, chain_id: u64, added_time: i64) -> TransactionDetails {
    TransactionDetails::new(
        from,
        chain_id,
        TransactionTypeInfo::Swap {
            input_currency: "USDC".into(),
            output_currency: "ETH".into(),
            input_amount: "2500000000".into(),
            expected_output_amount: "1000000000000000000".into(),
        },
        added_time,
    )
}

pub fn order(from: Address, chain_id: u64, order_hash: &str, added_time: i64) -> TransactionDetails {
    TransactionDetails::new_order(
        from,
        chain_id,
        order_hash,
        TransactionTypeInfo::Order {
            input_currency: "USDC".into(),
            output_currency: "ETH".into(),
            input_amount: "2500000000".into(),
            expected_output_amount: "1000000000000000000".into(),
        },
        added_time,
    )
}

pub fn mined_receipt(hash: H256, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: hash,
        block_number: Some(100u64.into()),
        block_hash: Some(H256::repeat_byte(0xbb)),
        gas_used: Some(U256::from(21_000)),
        effective_gas_price: Some(U256::from(2_000_000_000u64)),
        status: Some((success as u64).into()),
        ..Default::default()
    }
}

/// Delegates to the wrapped mock but never completes a broadcast
pub struct HangingSend(pub MockChainRpc);

#[async_trait]
impl ChainRpc for HangingSend {
    fn chain_id(&self) -> u64 {
        self.0.chain_id()
    }

    async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64> {
        self.0.get_transaction_count(address).await
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        self.0.get_transaction_receipt(hash).await
    }

    async fn transaction_exists(&self, hash: H256) -> OrchestratorResult<bool> {
        self.0.transaction_exists(hash).await
    }

    async fn send_raw_transaction(
        &self,
        _raw: Bytes,
        _via_private_relay: bool,
    ) -> OrchestratorResult<H256> {
        std::future::pending().await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> OrchestratorResult<U256> {
        self.0.estimate_gas(tx).await
    }

    async fn get_gas_price(&self) -> OrchestratorResult<GasPrice> {
        self.0.get_gas_price().await
    }

    fn supports_private_relay(&self) -> bool {
        self.0.supports_private_relay()
    }

    async fn private_relay_status(&self, hash: H256) -> OrchestratorResult<RelayStatus> {
        self.0.private_relay_status(hash).await
    }

    fn native_currency(&self) -> NativeCurrency {
        self.0.native_currency()
    }
}
