//! Signing capability and the transaction signer built on it

use super::gas::GasEstimator;
use super::types::TransactionRequest;
use crate::chain::ChainManager;
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque key holder able to sign transactions for one account
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_transaction(&self, tx: &TypedTransaction) -> OrchestratorResult<Signature>;
}

/// Signer holding a private key in memory
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn from_key(key: &str) -> OrchestratorResult<Self> {
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| OrchestratorError::Signer(format!("Invalid private key: {}", e)))?;
        Ok(Self::new(wallet))
    }

    /// Load the key from the named environment variable
    pub fn from_env(var: &str) -> OrchestratorResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            OrchestratorError::Signer(format!("No wallet configured. Set {}", var))
        })?;
        let signer = Self::from_key(&key)?;
        info!("Loaded wallet {:?} from {}", signer.address(), var);
        Ok(signer)
    }
}

#[async_trait]
impl WalletSigner for LocalWalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> OrchestratorResult<Signature> {
        Signer::sign_transaction(&self.wallet, tx)
            .await
            .map_err(|e| OrchestratorError::Signer(e.to_string()))
    }
}

/// Signature over a populated request
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub signature: Signature,
    pub raw: Bytes,
    pub hash: H256,
}

/// Populates requests from the chain and signs them with the wallet signer
pub struct TransactionSigner {
    signer: Arc<dyn WalletSigner>,
    chains: Arc<ChainManager>,
    gas: GasEstimator,
}

impl TransactionSigner {
    pub fn new(signer: Arc<dyn WalletSigner>, chains: Arc<ChainManager>) -> Self {
        Self {
            signer,
            chains,
            gas: GasEstimator::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Default population path: fill whatever the caller left out from the chain
    pub async fn populate(
        &self,
        mut request: TransactionRequest,
    ) -> OrchestratorResult<TransactionRequest> {
        if request.is_populated() {
            return Ok(request);
        }

        let provider = self.chains.get_provider(request.chain_id)?;

        if request.nonce.is_none() {
            request.nonce = Some(provider.get_transaction_count(request.from).await?);
        }
        if request.fees.is_none() {
            request.fees = Some(self.gas.get_gas_price(provider.as_ref()).await?);
        }
        if request.gas_limit.is_none() {
            let limit = self
                .gas
                .estimate_gas_limit(provider.as_ref(), &request.to_typed())
                .await?;
            request.gas_limit = Some(limit);
        }

        if let (Some(limit), Some(fees)) = (request.gas_limit, request.fees.as_ref()) {
            debug!(
                "Populated request on chain {}: nonce {:?}, max cost {} wei",
                request.chain_id,
                request.nonce,
                GasEstimator::calculate_cost(limit, fees)
            );
        }

        Ok(request)
    }

    /// Sign a populated request
    pub async fn sign(&self, request: &TransactionRequest) -> OrchestratorResult<SignedPayload> {
        if request.from != self.signer.address() {
            return Err(OrchestratorError::Signer(format!(
                "No signer for account {:?}",
                request.from
            )));
        }

        let tx = request.to_typed();
        let signature = self.signer.sign_transaction(&tx).await?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));

        Ok(SignedPayload {
            signature,
            raw,
            hash,
        })
    }
}
