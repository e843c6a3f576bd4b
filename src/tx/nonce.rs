//! Nonce calculation for reliable transaction submission
//!
//! Handles:
//! - Pending-aware chain nonce lookup
//! - Cross-referencing in-flight transactions tracked in the store
//! - Short-lived reservations so concurrent preparations never share a nonce

use super::types::{CalculatedNonce, NonceSource};
use crate::chain::ChainManager;
use crate::error::OrchestratorResult;
use crate::state::TransactionStore;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Nonces handed out but not yet visible in the store or on chain
#[derive(Default)]
struct AccountNonceState {
    /// nonce -> time handed out
    reserved: BTreeMap<u64, Instant>,
}

impl AccountNonceState {
    fn prune(&mut self, chain_nonce: u64, ttl: Duration) {
        let now = Instant::now();
        self.reserved
            .retain(|nonce, at| *nonce >= chain_nonce && now.duration_since(*at) < ttl);
    }

    fn highest(&self) -> Option<u64> {
        self.reserved.keys().next_back().copied()
    }
}

/// Calculates the next nonce for an account on a chain
pub struct NonceCalculator {
    chains: Arc<ChainManager>,
    store: Arc<dyn TransactionStore>,
    /// Per (account, chain) reservation state; the mutex serializes calculations
    accounts: DashMap<(Address, u64), Arc<Mutex<AccountNonceState>>>,
    reservation_ttl: Duration,
}

impl NonceCalculator {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn TransactionStore>,
        reservation_ttl: Duration,
    ) -> Self {
        Self {
            chains,
            store,
            accounts: DashMap::new(),
            reservation_ttl,
        }
    }

    fn account_state(&self, account: Address, chain_id: u64) -> Arc<Mutex<AccountNonceState>> {
        self.accounts
            .entry((account, chain_id))
            .or_default()
            .value()
            .clone()
    }

    /// max(chain pending count, highest locally tracked pending nonce + 1).
    /// The returned nonce stays reserved until released, mined past, or expired.
    pub async fn get_next_nonce(
        &self,
        account: Address,
        chain_id: u64,
        submit_via_private_relay: bool,
    ) -> OrchestratorResult<CalculatedNonce> {
        let provider = self.chains.get_provider(chain_id)?;
        let state = self.account_state(account, chain_id);
        let mut state = state.lock().await;

        let chain_nonce = provider.get_transaction_count(account).await?;

        // Transactions sent through a private relay are invisible to the public
        // pending count until mined, so the store is the only record of them.
        let tracked = self
            .store
            .pending_for_account(account, chain_id)
            .await?
            .into_iter()
            .filter(|tx| !tx.is_order())
            .filter_map(|tx| tx.options.nonce)
            .max();

        state.prune(chain_nonce, self.reservation_ttl);

        let highest_local = tracked.max(state.highest());
        let calculated = match highest_local {
            Some(highest) if highest + 1 > chain_nonce => CalculatedNonce {
                nonce: highest + 1,
                source: NonceSource::LocalOverride,
            },
            _ => CalculatedNonce {
                nonce: chain_nonce,
                source: NonceSource::Chain,
            },
        };

        state.reserved.insert(calculated.nonce, Instant::now());

        debug!(
            "Calculated nonce {} ({:?}) for {:?} on chain {} (chain={}, private={})",
            calculated.nonce, calculated.source, account, chain_id, chain_nonce, submit_via_private_relay
        );

        Ok(calculated)
    }

    /// Drop a reservation once the nonce is tracked elsewhere or was never used
    pub async fn release(&self, account: Address, chain_id: u64, nonce: u64) {
        let state = self.accounts.get(&(account, chain_id)).map(|s| s.value().clone());
        if let Some(state) = state {
            state.lock().await.reserved.remove(&nonce);
        }
    }

    /// Number of reservations currently held for the account
    pub async fn reserved_count(&self, account: Address, chain_id: u64) -> usize {
        let state = self.accounts.get(&(account, chain_id)).map(|s| s.value().clone());
        let Some(state) = state else {
            return 0;
        };
        let count = state.lock().await.reserved.len();
        count
    }
}
