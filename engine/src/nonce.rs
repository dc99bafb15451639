//! Per-sender nonce allocation.
//!
//! Each sender has its own async mutex, so allocation for one sender is a
//! single atomic region while independent senders never contend. A sender's
//! counter is seeded lazily from the chain on first use.

use std::sync::Arc;

use alloy::primitives::Address;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::ChainClient;
use crate::error::ChainError;

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out; `None` until seeded from the chain
    next_nonce: Option<u64>,
}

/// Single source of truth for the next nonce of every sender
pub struct NonceAllocator {
    client: Arc<dyn ChainClient>,
    senders: DashMap<Address, Arc<Mutex<NonceState>>>,
}

impl NonceAllocator {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            senders: DashMap::new(),
        }
    }

    fn slot(&self, address: Address) -> Arc<Mutex<NonceState>> {
        self.senders.entry(address).or_default().clone()
    }

    /// Hand out the next nonce for `address`
    pub async fn allocate(&self, address: Address) -> Result<u64, ChainError> {
        self.reserve(address, 1).await
    }

    /// Hand out `count` consecutive nonces, returning the first
    pub async fn reserve(&self, address: Address, count: u64) -> Result<u64, ChainError> {
        let slot = self.slot(address);
        let mut state = slot.lock().await;

        let start = match state.next_nonce {
            Some(next) => next,
            None => {
                let seeded = self.client.get_nonce(address).await?;
                debug!("[Nonce] Seeded {} from chain at {}", address, seeded);
                seeded
            }
        };
        state.next_nonce = Some(start + count);
        Ok(start)
    }

    /// Roll back an allocation that never reached the network.
    ///
    /// Only the most recently allocated nonce can be released; anything else
    /// would open a gap under nonces that are already live.
    pub async fn release(&self, address: Address, nonce: u64) -> bool {
        let slot = self.slot(address);
        let mut state = slot.lock().await;

        match state.next_nonce {
            Some(next) if next > 0 && next - 1 == nonce => {
                state.next_nonce = Some(nonce);
                debug!("[Nonce] Released {} for {}", nonce, address);
                true
            }
            other => {
                warn!(
                    "[Nonce] Refusing to release {} for {} (next is {:?})",
                    nonce, address, other
                );
                false
            }
        }
    }

    /// Overwrite the counter with the chain-reported transaction count
    pub async fn resync(&self, address: Address, chain_count: u64) {
        let slot = self.slot(address);
        let mut state = slot.lock().await;
        if state.next_nonce != Some(chain_count) {
            info!(
                "[Nonce] Resync {}: {:?} -> {}",
                address, state.next_nonce, chain_count
            );
        }
        state.next_nonce = Some(chain_count);
    }

    /// Fetch the chain's count and resync with it.
    ///
    /// The fetch happens inside the sender's critical section so no
    /// allocation can observe the stale value in between.
    pub async fn refresh(&self, address: Address) -> Result<u64, ChainError> {
        let slot = self.slot(address);
        let mut state = slot.lock().await;
        let chain_count = self.client.get_nonce(address).await?;
        if state.next_nonce != Some(chain_count) {
            info!(
                "[Nonce] Refreshed {}: {:?} -> {}",
                address, state.next_nonce, chain_count
            );
        }
        state.next_nonce = Some(chain_count);
        Ok(chain_count)
    }

    /// Current counter for `address`, if seeded
    pub async fn peek(&self, address: Address) -> Option<u64> {
        let slot = self.senders.get(&address).map(|s| s.clone())?;
        let state = slot.lock().await;
        state.next_nonce
    }

    /// Number of senders with state
    pub fn tracked_senders(&self) -> usize {
        self.senders.len()
    }
}
