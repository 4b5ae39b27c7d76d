//! Export-then-erase of everything stored for a wallet

use super::delivery::{
    Delivered, DeliveryMode, DownloadDelivery, ExportDelivery, FarcasterDelivery,
};
use super::export::ExportArtifact;
use crate::error::{SweeperError, SweeperResult};
use crate::farcaster::DirectCastClient;
use crate::state::SessionStore;
use crate::watch::WatchScheduler;

use ethers::types::Address;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct RevocationService {
    store: Arc<dyn SessionStore>,
    scheduler: Arc<WatchScheduler>,
    direct_cast: Option<DirectCastClient>,
    export_dir: Option<PathBuf>,
}

impl RevocationService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        scheduler: Arc<WatchScheduler>,
        direct_cast: Option<DirectCastClient>,
        export_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            scheduler,
            direct_cast,
            export_dir,
        }
    }

    /// Export the wallet's data through `mode`, then delete it
    pub async fn revoke(&self, wallet: Address, mode: DeliveryMode) -> SweeperResult<Delivered> {
        info!("Revoking {:?} via {}", wallet, mode.channel());
        match mode {
            DeliveryMode::Download => self.revoke_with(wallet, &DownloadDelivery).await,
            DeliveryMode::Farcaster { fid } => {
                let client = self.direct_cast.clone().ok_or_else(|| {
                    SweeperError::Internal("Farcaster delivery is not configured".to_string())
                })?;
                self.revoke_with(wallet, &FarcasterDelivery::new(client, fid))
                    .await
            }
        }
    }

    /// Nothing is deleted unless `delivery` succeeds. The artifact is removed
    /// on every path.
    pub async fn revoke_with(
        &self,
        wallet: Address,
        delivery: &dyn ExportDelivery,
    ) -> SweeperResult<Delivered> {
        let channel = delivery.channel();
        let result = self.export_and_erase(wallet, delivery).await;
        crate::metrics::record_revocation(channel, result.is_ok());

        if let Err(e) = &result {
            error!("Revocation of {:?} via {} failed: {}", wallet, channel, e);
        }
        result
    }

    async fn export_and_erase(
        &self,
        wallet: Address,
        delivery: &dyn ExportDelivery,
    ) -> SweeperResult<Delivered> {
        let snapshot = self.store.snapshot_for_wallet(wallet).await?;
        info!(
            "Exporting {:?}: {} sessions, {} records",
            wallet,
            snapshot.sessions.len(),
            snapshot.transactions.len()
        );

        let mut artifact = ExportArtifact::write(self.export_dir.as_deref(), &snapshot)?;

        // On error the artifact is dropped here, which removes the file
        let delivered = delivery.deliver(&mut artifact).await?;

        if let Err(e) = artifact.remove() {
            warn!("Failed to remove export artifact for {:?}: {}", wallet, e);
        }

        let mut stopped = self.scheduler.stop_wallet(wallet).await;
        let erased = self.store.delete_all_for_wallet(wallet).await?;

        // A session started after `stop_wallet` is gone from the store now;
        // its poller must not outlive it
        let late = self.scheduler.stop_sessions(&erased.session_ids).await;
        if late > 0 {
            warn!("Stopped {} pollers started during revocation of {:?}", late, wallet);
            stopped += late;
        }

        info!(
            "Revoked {:?}: {} pollers stopped, {} sessions and {} records deleted",
            wallet,
            stopped,
            erased.sessions(),
            erased.transfers
        );

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainDataProvider;
    use crate::config::WatcherConfig;
    use crate::state::{
        ErasedWallet, MemorySessionStore, NewSession, NewTransferRecord, RecordKind,
        TransferFilter, TransferMode, TransferRecord, WalletSnapshot, WatchSession,
    };
    use crate::tx::MockTransferExecutor;
    use async_trait::async_trait;
    use ethers::types::U256;
    use std::sync::{Mutex, OnceLock};
    use uuid::Uuid;

    fn wallet() -> Address {
        Address::repeat_byte(0x11)
    }

    struct FailingDelivery {
        seen: Mutex<Option<PathBuf>>,
    }

    #[async_trait]
    impl ExportDelivery for FailingDelivery {
        fn channel(&self) -> &'static str {
            "failing"
        }

        async fn deliver(&self, artifact: &mut ExportArtifact) -> SweeperResult<Delivered> {
            *self.seen.lock().unwrap() = Some(artifact.path().to_path_buf());
            Err(SweeperError::upstream("direct-cast", "unreachable"))
        }
    }

    fn new_session() -> NewSession {
        NewSession {
            watched_address: wallet(),
            destination_address: Address::repeat_byte(0x22),
            transfer_mode: TransferMode::ZeroOut,
            tracked_tokens: Vec::new(),
            gas_sponsored: false,
            warpcast_fid: None,
        }
    }

    /// Memory store that opens a fresh session for the wallet, with a running
    /// poller, right before an erase
    struct RestartingStore {
        inner: MemorySessionStore,
        scheduler: OnceLock<Arc<WatchScheduler>>,
    }

    #[async_trait]
    impl SessionStore for RestartingStore {
        async fn create_session(&self, new: NewSession) -> SweeperResult<WatchSession> {
            self.inner.create_session(new).await
        }

        async fn stop_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>> {
            self.inner.stop_session(id).await
        }

        async fn get_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>> {
            self.inner.get_session(id).await
        }

        async fn latest_session_for_wallet(
            &self,
            wallet: Address,
        ) -> SweeperResult<Option<WatchSession>> {
            self.inner.latest_session_for_wallet(wallet).await
        }

        async fn active_sessions(&self) -> SweeperResult<Vec<WatchSession>> {
            self.inner.active_sessions().await
        }

        async fn record_transfer(&self, record: NewTransferRecord) -> SweeperResult<bool> {
            self.inner.record_transfer(record).await
        }

        async fn list_transfers(
            &self,
            filter: TransferFilter,
        ) -> SweeperResult<Vec<TransferRecord>> {
            self.inner.list_transfers(filter).await
        }

        async fn snapshot_for_wallet(&self, wallet: Address) -> SweeperResult<WalletSnapshot> {
            self.inner.snapshot_for_wallet(wallet).await
        }

        async fn delete_all_for_wallet(&self, wallet: Address) -> SweeperResult<ErasedWallet> {
            let session = self.inner.create_session(new_session()).await?;
            if let Some(scheduler) = self.scheduler.get() {
                scheduler.start_watching(session);
            }
            self.inner.delete_all_for_wallet(wallet).await
        }

        async fn health_check(&self) -> SweeperResult<()> {
            Ok(())
        }
    }

    fn watcher_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval_ms: 60_000,
            poll_timeout_ms: 1_000,
            data_rpc_url: "http://localhost".to_string(),
            max_transfers_per_poll: 100,
            max_page_size: 100,
            shutdown_grace_ms: 1_000,
        }
    }

    async fn seeded() -> (Arc<MemorySessionStore>, RevocationService, tempfile::TempDir) {
        let store = Arc::new(MemorySessionStore::new());
        let session = store.create_session(new_session()).await.unwrap();
        store
            .record_transfer(NewTransferRecord {
                session_id: Some(session.id),
                from_address: Some(wallet()),
                to_address: Some(Address::repeat_byte(0x22)),
                amount: Some(U256::from(5)),
                kind: Some(RecordKind::Transfer),
                ..Default::default()
            })
            .await
            .unwrap();

        let scheduler = Arc::new(WatchScheduler::new(
            store.clone(),
            Arc::new(MockChainDataProvider::new()),
            Arc::new(MockTransferExecutor::new()),
            &watcher_config(),
        ));
        scheduler.start_watching(session);

        let dir = tempfile::tempdir().unwrap();
        let service = RevocationService::new(
            store.clone(),
            scheduler,
            None,
            Some(dir.path().to_path_buf()),
        );
        (store, service, dir)
    }

    fn dir_is_empty(dir: &tempfile::TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    async fn record_count(store: &MemorySessionStore) -> usize {
        store
            .list_transfers(TransferFilter {
                session_id: None,
                limit: 100,
            })
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_successful_revoke_erases_wallet() {
        let (store, service, dir) = seeded().await;

        let delivered = service.revoke(wallet(), DeliveryMode::Download).await.unwrap();
        match delivered {
            Delivered::Download { file_name, body } => {
                assert_eq!(file_name, format!("wally_data_{}.json", "11".repeat(20)));
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["sessions"].as_array().unwrap().len(), 1);
                assert_eq!(value["transactions"].as_array().unwrap().len(), 1);
            }
            other => panic!("unexpected delivery {:?}", other),
        }

        assert!(store.latest_session_for_wallet(wallet()).await.unwrap().is_none());
        assert_eq!(record_count(&store).await, 0);
        assert!(service.scheduler.active_count() == 0);
        assert!(dir_is_empty(&dir));
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_data() {
        let (store, service, dir) = seeded().await;
        let delivery = FailingDelivery {
            seen: Mutex::new(None),
        };

        tokio_test::assert_err!(service.revoke_with(wallet(), &delivery).await);

        let artifact = delivery.seen.lock().unwrap().clone().unwrap();
        assert!(!artifact.exists());
        assert!(dir_is_empty(&dir));

        assert!(store.latest_session_for_wallet(wallet()).await.unwrap().is_some());
        assert_eq!(record_count(&store).await, 1);
        assert_eq!(service.scheduler.active_count(), 1);

        service.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_farcaster_without_client_deletes_nothing() {
        let (store, service, _dir) = seeded().await;

        let result = service
            .revoke(wallet(), DeliveryMode::Farcaster { fid: 7 })
            .await;
        assert!(matches!(result, Err(SweeperError::Internal(_))));
        assert_eq!(record_count(&store).await, 1);

        service.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_started_during_revoke_is_not_left_polling() {
        let store = Arc::new(RestartingStore {
            inner: MemorySessionStore::new(),
            scheduler: OnceLock::new(),
        });
        let scheduler = Arc::new(WatchScheduler::new(
            store.clone(),
            Arc::new(MockChainDataProvider::new()),
            Arc::new(MockTransferExecutor::new()),
            &watcher_config(),
        ));
        let _ = store.scheduler.set(scheduler.clone());

        // Every earlier session is already stopped, so nothing blocks a new one
        let old = store.inner.create_session(new_session()).await.unwrap();
        store.inner.stop_session(old.id).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let service = RevocationService::new(
            store.clone(),
            scheduler.clone(),
            None,
            Some(dir.path().to_path_buf()),
        );

        tokio_test::assert_ok!(service.revoke(wallet(), DeliveryMode::Download).await);

        assert!(store.inner.latest_session_for_wallet(wallet()).await.unwrap().is_none());
        assert_eq!(scheduler.active_count(), 0);
    }
}
