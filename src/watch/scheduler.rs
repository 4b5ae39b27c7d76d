//! Per-session polling tasks
//!
//! Each Active session gets exactly one poller task. A poller runs its ticks
//! strictly in sequence on a fixed interval; pollers for different sessions
//! are independent tasks. Stopping a poller signals it, waits for it to exit
//! and only then returns, so no record is written for a session after
//! [`WatchScheduler::stop_watching`] has returned.

use crate::chain::{ChainDataProvider, IncomingTransfer, TransferCursor};
use crate::config::WatcherConfig;
use crate::error::{SweeperError, SweeperResult};
use crate::state::{NewTransferRecord, RecordKind, SessionStore, WatchSession};
use crate::tx::{TransferExecutor, TransferRequest};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct PollerHandle {
    wallet: Address,
    shutdown: watch::Sender<bool>,
    /// Set while the poller is inside the executor
    sweeping: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns the poller registry. Created once at boot; [`shutdown`](Self::shutdown)
/// drains it.
pub struct WatchScheduler {
    store: Arc<dyn SessionStore>,
    chain: Arc<dyn ChainDataProvider>,
    executor: Arc<dyn TransferExecutor>,
    poll_interval: Duration,
    poll_timeout: Duration,
    shutdown_grace: Duration,
    pollers: DashMap<Uuid, PollerHandle>,
}

impl WatchScheduler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        chain: Arc<dyn ChainDataProvider>,
        executor: Arc<dyn TransferExecutor>,
        config: &WatcherConfig,
    ) -> Self {
        Self {
            store,
            chain,
            executor,
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
            shutdown_grace: config.shutdown_grace(),
            pollers: DashMap::new(),
        }
    }

    /// Start polling a session. Returns `false` (and does nothing) if the
    /// session already has a poller or is not Active.
    pub fn start_watching(&self, session: WatchSession) -> bool {
        if !session.is_active() {
            return false;
        }

        match self.pollers.entry(session.id) {
            Entry::Occupied(_) => {
                debug!("Session {} already has a poller", session.id);
                false
            }
            Entry::Vacant(slot) => {
                let (shutdown, signal) = watch::channel(false);
                let sweeping = Arc::new(AtomicBool::new(false));
                let wallet = session.watched_address;
                let id = session.id;

                let poller = Poller {
                    session,
                    store: self.store.clone(),
                    chain: self.chain.clone(),
                    executor: self.executor.clone(),
                    poll_timeout: self.poll_timeout,
                    cursor: None,
                    signal,
                    sweeping: sweeping.clone(),
                };
                let task = tokio::spawn(poller.run(self.poll_interval));

                slot.insert(PollerHandle {
                    wallet,
                    shutdown,
                    sweeping,
                    task,
                });
                info!("Started watching {:?} (session {})", wallet, id);
                true
            }
        }
    }

    /// Cancel a session's poller. Idempotent; returns whether one was running.
    ///
    /// With `revoke`, every stored record for the session's wallet is deleted
    /// once the poller is gone, and any poller still attached to a deleted
    /// session is stopped.
    pub async fn stop_watching(&self, session_id: Uuid, revoke: bool) -> SweeperResult<bool> {
        let removed = self.pollers.remove(&session_id);
        let was_running = removed.is_some();

        let mut wallet = None;
        if let Some((_, handle)) = removed {
            wallet = Some(handle.wallet);
            self.join(session_id, handle).await;
        }

        if revoke {
            let wallet = match wallet {
                Some(wallet) => Some(wallet),
                None => self
                    .store
                    .get_session(session_id)
                    .await?
                    .map(|s| s.watched_address),
            };
            if let Some(wallet) = wallet {
                let deleted = self.store.delete_all_for_wallet(wallet).await?;
                let orphans = self.stop_sessions(&deleted.session_ids).await;
                info!(
                    "Revoked {:?}: {} sessions, {} records deleted, {} pollers stopped",
                    wallet,
                    deleted.sessions(),
                    deleted.transfers,
                    orphans
                );
            }
        }

        Ok(was_running)
    }

    /// Cancel every poller watching `wallet`
    pub async fn stop_wallet(&self, wallet: Address) -> usize {
        let ids: Vec<Uuid> = self
            .pollers
            .iter()
            .filter(|entry| entry.value().wallet == wallet)
            .map(|entry| *entry.key())
            .collect();

        self.stop_sessions(&ids).await
    }

    /// Cancel the pollers of the given sessions, returning how many ran
    pub async fn stop_sessions(&self, ids: &[Uuid]) -> usize {
        let mut stopped = 0;
        for id in ids {
            if let Some((_, handle)) = self.pollers.remove(id) {
                self.join(*id, handle).await;
                stopped += 1;
            }
        }
        stopped
    }

    async fn join(&self, session_id: Uuid, mut handle: PollerHandle) {
        // A closed receiver means the task already exited
        let _ = handle.shutdown.send(true);

        let within_grace = tokio::time::timeout(self.shutdown_grace, &mut handle.task).await;
        let result = match within_grace {
            // The executor bounds its own submission; aborting it mid-flight
            // could move funds without a record
            Err(_) if handle.sweeping.load(Ordering::SeqCst) => {
                warn!(
                    "Session {} has a sweep in flight; waiting for it to settle",
                    session_id
                );
                Ok((&mut handle.task).await)
            }
            other => other,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("Poller for session {} panicked", session_id),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    "Poller for session {} did not stop within {:?}; aborting",
                    session_id, self.shutdown_grace
                );
                handle.task.abort();
                let _ = handle.task.await;
            }
        }
        info!("Stopped watching session {}", session_id);
    }

    /// Start pollers for every Active session in the store
    pub async fn restore(&self) -> SweeperResult<usize> {
        let mut started = 0;
        for session in self.store.active_sessions().await? {
            if self.start_watching(session) {
                started += 1;
            }
        }
        info!("Restored {} watch sessions", started);
        Ok(started)
    }

    /// Stop every poller
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.pollers.iter().map(|entry| *entry.key()).collect();
        let handles: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.pollers.remove(&id))
            .collect();

        let count = handles.len();
        futures::future::join_all(
            handles
                .into_iter()
                .map(|(id, handle)| self.join(id, handle)),
        )
        .await;
        info!("Drained {} pollers", count);
    }

    pub fn is_watching(&self, session_id: Uuid) -> bool {
        self.pollers.contains_key(&session_id)
    }

    pub fn active_count(&self) -> usize {
        self.pollers.len()
    }
}

/// Decrements the active-poller gauge however the task ends
struct PollerGauge;

impl PollerGauge {
    fn new() -> Self {
        crate::metrics::record_poller_started();
        Self
    }
}

impl Drop for PollerGauge {
    fn drop(&mut self) {
        crate::metrics::record_poller_stopped();
    }
}

#[derive(Debug)]
enum TickError {
    Stopped,
    Failed(SweeperError),
}

impl From<SweeperError> for TickError {
    fn from(e: SweeperError) -> Self {
        TickError::Failed(e)
    }
}

struct Poller {
    session: WatchSession,
    store: Arc<dyn SessionStore>,
    chain: Arc<dyn ChainDataProvider>,
    executor: Arc<dyn TransferExecutor>,
    poll_timeout: Duration,
    /// Where the next transfer fetch resumes; `None` until the first tick
    cursor: Option<TransferCursor>,
    signal: watch::Receiver<bool>,
    sweeping: Arc<AtomicBool>,
}

impl Poller {
    async fn run(mut self, interval: Duration) {
        let _gauge = PollerGauge::new();

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut signal = self.signal.clone();
        loop {
            tokio::select! {
                _ = signal.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.stopped() {
                break;
            }

            let started = Instant::now();
            match self.tick().await {
                Ok(()) => {
                    crate::metrics::record_poll_tick(true, started.elapsed().as_secs_f64());
                }
                Err(TickError::Stopped) => break,
                Err(TickError::Failed(e)) => {
                    crate::metrics::record_poll_tick(false, started.elapsed().as_secs_f64());
                    if e.is_retryable() {
                        warn!("Poll tick failed for session {}: {}", self.session.id, e);
                    } else {
                        error!("Poll tick failed for session {}: {}", self.session.id, e);
                    }
                }
            }
        }

        debug!("Poller for session {} exited", self.session.id);
    }

    fn stopped(&self) -> bool {
        *self.signal.borrow()
    }

    /// Run a network call unless the poller is stopped first, bounded by the
    /// poll timeout
    async fn remote<T, F>(&self, operation: &str, call: F) -> Result<T, TickError>
    where
        F: Future<Output = SweeperResult<T>>,
    {
        let mut signal = self.signal.clone();
        if *signal.borrow() {
            return Err(TickError::Stopped);
        }

        tokio::select! {
            _ = signal.changed() => Err(TickError::Stopped),
            result = tokio::time::timeout(self.poll_timeout, call) => match result {
                Ok(result) => result.map_err(TickError::Failed),
                Err(_) => Err(TickError::Failed(SweeperError::Timeout {
                    operation: operation.to_string(),
                })),
            },
        }
    }

    /// Store write; refused once the poller has been told to stop
    async fn write(&self, record: NewTransferRecord) -> Result<bool, TickError> {
        if self.stopped() {
            return Err(TickError::Stopped);
        }
        Ok(self.store.record_transfer(record).await?)
    }

    async fn tick(&mut self) -> Result<(), TickError> {
        let wallet = self.session.watched_address;

        let batch = self
            .remote(
                "fetch incoming transfers",
                self.chain.incoming_transfers(wallet, self.cursor.clone()),
            )
            .await?;

        for transfer in &batch.transfers {
            if self.write(self.incoming_record(transfer)).await? {
                crate::metrics::record_incoming_transfer(transfer.token.is_none());
                debug!(
                    "Recorded incoming transfer {} for session {}",
                    transfer.source_id, self.session.id
                );
            }
        }
        self.cursor = Some(batch.next);

        for asset in self.session.swept_assets() {
            let balance = self
                .remote("fetch balance", self.chain.balance(wallet, asset))
                .await?;

            if let Some(amount) = self.session.transfer_mode.sweep_amount(balance) {
                self.sweep(asset, amount).await?;
            }
        }

        Ok(())
    }

    fn incoming_record(&self, transfer: &IncomingTransfer) -> NewTransferRecord {
        NewTransferRecord {
            session_id: Some(self.session.id),
            from_address: transfer.from,
            to_address: Some(transfer.to),
            token_address: transfer.token,
            amount: Some(transfer.amount),
            tx_hash: transfer.tx_hash.clone(),
            kind: Some(RecordKind::Transfer),
            message: None,
            source_id: Some(transfer.source_id.clone()),
        }
    }

    async fn sweep(&self, asset: Option<Address>, amount: U256) -> Result<(), TickError> {
        let session = &self.session;
        let mode = session.transfer_mode.name();
        let request = TransferRequest {
            session_id: session.id,
            from: session.watched_address,
            to: session.destination_address,
            token: asset,
            amount,
            sponsored: session.gas_sponsored,
        };

        info!(
            "Sweeping {} of {:?} from {:?} to {:?}",
            amount, asset, session.watched_address, session.destination_address
        );

        if self.stopped() {
            return Err(TickError::Stopped);
        }

        // Not raced against the stop signal: dropping the executor partway
        // through can leak a nonce or lose track of a broadcast transaction
        self.sweeping.store(true, Ordering::SeqCst);
        let outcome = self.executor.execute(request).await;
        self.sweeping.store(false, Ordering::SeqCst);

        match outcome {
            Ok(receipt) if self.stopped() => {
                crate::metrics::record_sweep(mode, true);
                warn!(
                    "Session {} stopped during sweep {:?}; not recording it",
                    session.id, receipt.tx_hash
                );
                return Err(TickError::Stopped);
            }
            Ok(receipt) => {
                crate::metrics::record_sweep(mode, true);
                let kind = if session.gas_sponsored {
                    RecordKind::PaymasterTransfer
                } else {
                    RecordKind::Transfer
                };
                self.write(NewTransferRecord {
                    session_id: Some(session.id),
                    from_address: Some(session.watched_address),
                    to_address: Some(session.destination_address),
                    token_address: asset,
                    amount: Some(amount),
                    tx_hash: Some(format!("{:?}", receipt.tx_hash)),
                    kind: Some(kind),
                    message: Some(format!(
                        "Transferred {} from {:?} to {:?}",
                        amount, session.watched_address, session.destination_address
                    )),
                    source_id: None,
                })
                .await?;
            }
            Err(failure) => {
                // Not retried here; the next tick re-evaluates the balance
                crate::metrics::record_sweep(mode, false);
                warn!("Sweep failed for session {}: {}", session.id, failure);
            }
        }

        Ok(())
    }
}
