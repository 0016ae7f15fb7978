//! Nonce management for concurrent dispatches
//!
//! Handles:
//! - Local nonce tracking so parallel workers on one chain never collide
//! - Lazy seeding from the pending transaction count
//! - Release of unused nonces and resync after "nonce too low"

use crate::chain::ChainProvider;
use crate::error::DisperserResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
#[derive(Debug, Default)]
struct ChainNonceState {
    /// Next nonce to hand out; None until seeded from the chain
    next: Option<u64>,
}

/// Manages the distributor nonce across chains
#[derive(Default)]
pub struct NonceManager {
    chain_state: DashMap<u64, Arc<Mutex<ChainNonceState>>>,
}

impl NonceManager {
    /// Create a new nonce manager
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, chain_id: u64) -> Arc<Mutex<ChainNonceState>> {
        self.chain_state
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChainNonceState::default())))
            .value()
            .clone()
    }

    /// Allocate the next nonce for `wallet` on the provider's chain
    pub async fn allocate(&self, provider: &ChainProvider, wallet: Address) -> DisperserResult<u64> {
        let chain_id = provider.chain_id();
        let state = self.state(chain_id);
        let mut state = state.lock().await;

        let nonce = match state.next {
            Some(n) => n,
            None => {
                let on_chain = provider.get_transaction_count(wallet).await?;
                debug!("Seeded nonce for chain {}: {}", chain_id, on_chain);
                on_chain
            }
        };
        state.next = Some(nonce + 1);

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Give back a nonce whose transaction never reached the mempool
    pub async fn release(&self, chain_id: u64, nonce: u64) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;

        // Only the most recent allocation can be rewound without leaving a gap
        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
            debug!("Released nonce {} on chain {}", nonce, chain_id);
        } else {
            // Force a reseed so the gap is closed by the chain's view
            state.next = None;
            warn!(
                "Released out-of-order nonce {} on chain {}, will reseed",
                nonce, chain_id
            );
        }
    }

    /// Forget local state so the next allocation reseeds from the chain
    pub async fn reset(&self, chain_id: u64) {
        let state = self.state(chain_id);
        state.lock().await.next = None;
        debug!("Nonce state reset for chain {}", chain_id);
    }

    /// Seed or overwrite the next nonce directly
    #[cfg(test)]
    async fn seed(&self, chain_id: u64, next: u64) {
        let state = self.state(chain_id);
        state.lock().await.next = Some(next);
    }

    /// Number of chains with tracked nonce state
    pub fn tracked_chains(&self) -> usize {
        self.chain_state.len()
    }

    /// Next nonce the manager would hand out, if seeded
    #[cfg(test)]
    async fn next_nonce(&self, chain_id: u64) -> Option<u64> {
        let state = self.state(chain_id);
        let next = state.lock().await.next;
        next
    }
}
