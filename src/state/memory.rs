//! In-process session store

use super::models::{
    ErasedWallet, NewSession, NewTransferRecord, SessionStatus, TransferFilter, TransferRecord,
    WalletSnapshot, WatchSession,
};
use super::store::SessionStore;
use crate::error::{SweeperError, SweeperResult};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, WatchSession>,
    /// Insertion order is creation order
    transfers: Vec<TransferRecord>,
    source_ids: HashSet<(Option<Uuid>, String)>,
}

/// Session store backed by process memory.
///
/// All operations take the single table lock, so each mutation is atomic
/// relative to every reader.
#[derive(Default)]
pub struct MemorySessionStore {
    tables: RwLock<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, new: NewSession) -> SweeperResult<WatchSession> {
        if new.watched_address == new.destination_address {
            return Err(SweeperError::Validation(
                "Watched cannot equal Destination.".to_string(),
            ));
        }

        let mut tables = self.tables.write().await;
        let already_active = tables
            .sessions
            .values()
            .any(|s| s.is_active() && s.watched_address == new.watched_address);
        if already_active {
            return Err(SweeperError::Conflict(
                "Wallet is already being watched.".to_string(),
            ));
        }

        let session = new.into_session();
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn stop_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>> {
        let mut tables = self.tables.write().await;
        Ok(tables.sessions.get_mut(&id).map(|session| {
            if session.is_active() {
                session.status = SessionStatus::Stopped;
                session.stopped_at = Some(Utc::now());
            }
            session.clone()
        }))
    }

    async fn get_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>> {
        Ok(self.tables.read().await.sessions.get(&id).cloned())
    }

    async fn latest_session_for_wallet(
        &self,
        wallet: Address,
    ) -> SweeperResult<Option<WatchSession>> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.watched_address == wallet)
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn active_sessions(&self) -> SweeperResult<Vec<WatchSession>> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }

    async fn record_transfer(&self, record: NewTransferRecord) -> SweeperResult<bool> {
        let mut tables = self.tables.write().await;
        if let Some(source_id) = &record.source_id {
            if !tables
                .source_ids
                .insert((record.session_id, source_id.clone()))
            {
                return Ok(false);
            }
        }

        tables.transfers.push(record.into_record());
        Ok(true)
    }

    async fn list_transfers(&self, filter: TransferFilter) -> SweeperResult<Vec<TransferRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transfers
            .iter()
            .rev()
            .filter(|t| filter.session_id.is_none() || t.session_id == filter.session_id)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn snapshot_for_wallet(&self, wallet: Address) -> SweeperResult<WalletSnapshot> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<WatchSession> = tables
            .sessions
            .values()
            .filter(|s| s.watched_address == wallet)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);

        let session_ids: HashSet<Uuid> = sessions.iter().map(|s| s.id).collect();
        let transactions = tables
            .transfers
            .iter()
            .filter(|t| {
                t.references(&wallet) || t.session_id.map_or(false, |id| session_ids.contains(&id))
            })
            .cloned()
            .collect();

        Ok(WalletSnapshot {
            wallet,
            exported_at: Utc::now(),
            sessions,
            transactions,
        })
    }

    async fn delete_all_for_wallet(&self, wallet: Address) -> SweeperResult<ErasedWallet> {
        let mut tables = self.tables.write().await;

        let session_ids: HashSet<Uuid> = tables
            .sessions
            .values()
            .filter(|s| s.watched_address == wallet)
            .map(|s| s.id)
            .collect();
        tables.sessions.retain(|id, _| !session_ids.contains(id));

        let before = tables.transfers.len();
        tables.transfers.retain(|t| {
            !(t.references(&wallet) || t.session_id.map_or(false, |id| session_ids.contains(&id)))
        });
        let transfers = (before - tables.transfers.len()) as u64;

        tables
            .source_ids
            .retain(|(session_id, _)| session_id.map_or(true, |id| !session_ids.contains(&id)));

        let mut session_ids: Vec<Uuid> = session_ids.into_iter().collect();
        session_ids.sort();
        Ok(ErasedWallet {
            session_ids,
            transfers,
        })
    }

    async fn health_check(&self) -> SweeperResult<()> {
        Ok(())
    }
}
