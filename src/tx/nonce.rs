//! Nonce management for the sweep signer
//!
//! Handles:
//! - Local nonce allocation so concurrent sweeps do not collide
//! - Releasing a nonce that never reached the network, including when the
//!   submitting future is dropped
//! - Resync with the chain after "nonce too low"

use crate::error::{SweeperError, SweeperResult};

use ethers::prelude::*;
use ethers::types::{Address, BlockNumber, H256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted, not yet confirmed: nonce -> tx hash
    pending: BTreeMap<u64, H256>,
}

/// Allocates nonces for one signer on one chain
pub struct NonceManager {
    signer: Address,
    state: Mutex<Option<NonceState>>,
}

impl NonceManager {
    pub fn new(signer: Address) -> Self {
        Self {
            signer,
            state: Mutex::new(None),
        }
    }

    /// Next nonce, fetching the on-chain count on first use
    pub async fn next(&self, provider: &Provider<Http>) -> SweeperResult<u64> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let on_chain = self.fetch_nonce(provider).await?;
            *guard = Some(NonceState {
                current: on_chain,
                pending: BTreeMap::new(),
            });
            debug!("Initialized signer nonce at {}", on_chain);
        }

        Ok(Self::allocate(guard.get_or_insert_with(NonceState::default)))
    }

    /// Allocate a nonce that is handed back unless it is settled
    pub async fn lease(self: &Arc<Self>, provider: &Provider<Http>) -> SweeperResult<NonceLease> {
        let nonce = self.next(provider).await?;
        Ok(NonceLease {
            manager: self.clone(),
            nonce,
            settled: false,
        })
    }

    fn allocate(state: &mut NonceState) -> u64 {
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {}", nonce);
        nonce
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: H256) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.pending.insert(nonce, tx_hash);
        }
    }

    /// Transaction mined
    pub async fn confirm(&self, nonce: u64) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.pending.remove(&nonce);
        }
    }

    /// Submission failed; the nonce can be handed out again if it was the
    /// most recent one
    pub async fn release(&self, nonce: u64) {
        if let Some(state) = self.state.lock().await.as_mut() {
            Self::release_in(state, nonce);
        }
    }

    fn release_in(state: &mut NonceState, nonce: u64) {
        state.pending.remove(&nonce);
        if nonce + 1 == state.current {
            state.current = nonce;
        }
    }

    /// Release from a synchronous context. Falls back to a task when the
    /// state is busy.
    fn release_detached(self: &Arc<Self>, nonce: u64) {
        if let Ok(mut guard) = self.state.try_lock() {
            if let Some(state) = guard.as_mut() {
                Self::release_in(state, nonce);
            }
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.clone();
                handle.spawn(async move { manager.release(nonce).await });
            }
            Err(_) => warn!("Nonce {} abandoned outside the runtime", nonce),
        }
    }

    /// Sync with the on-chain pending count
    pub async fn sync(&self, provider: &Provider<Http>) -> SweeperResult<()> {
        let on_chain = self.fetch_nonce(provider).await?;
        let mut guard = self.state.lock().await;
        Self::sync_in(guard.get_or_insert_with(NonceState::default), on_chain);
        Ok(())
    }

    fn sync_in(state: &mut NonceState, on_chain: u64) {
        if on_chain > state.current {
            warn!(
                "Nonce gap detected: local {}, on chain {}",
                state.current, on_chain
            );
        }

        // Everything below the on-chain count has been mined
        state.pending = state.pending.split_off(&on_chain);
        state.current = state.current.max(on_chain);
    }

    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .as_ref()
            .map_or(0, |s| s.pending.len())
    }

    async fn fetch_nonce(&self, provider: &Provider<Http>) -> SweeperResult<u64> {
        let nonce = provider
            .get_transaction_count(self.signer, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| SweeperError::upstream("nonce", e))?;

        Ok(nonce.as_u64())
    }
}

/// An allocated nonce. Dropping it unsettled returns it to the manager.
pub struct NonceLease {
    manager: Arc<NonceManager>,
    nonce: u64,
    settled: bool,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The transaction may have reached the network; only a confirmation or
    /// a resync retires the nonce from here on
    pub fn settle(mut self) -> u64 {
        self.settled = true;
        self.nonce
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Returning unused nonce {}", self.nonce);
            self.manager.release_detached(self.nonce);
        }
    }
}
