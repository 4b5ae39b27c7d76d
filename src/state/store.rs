//! Storage boundary shared by request handlers and poll ticks

use super::models::{
    ErasedWallet, NewSession, NewTransferRecord, TransferFilter, TransferRecord, WalletSnapshot,
    WatchSession,
};
use crate::error::SweeperResult;

use async_trait::async_trait;
use ethers::types::Address;
use uuid::Uuid;

/// Durable record of watch sessions and transfer history.
///
/// Every mutation is a single atomic operation with respect to concurrent
/// callers: session creation is an insert guarded by the one-Active-session
/// rule, stopping is a single-row update, and wallet erasure deletes all rows
/// or none.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create an Active session.
    ///
    /// Fails with `Validation` when watched equals destination and with
    /// `Conflict` when the watched wallet already has an Active session.
    async fn create_session(&self, new: NewSession) -> SweeperResult<WatchSession>;

    /// Ensure the session is Stopped. Unknown or already stopped ids are not
    /// an error; the stored session (if any) is returned.
    async fn stop_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>>;

    async fn get_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>>;

    /// Most recently started session for a wallet, regardless of status
    async fn latest_session_for_wallet(&self, wallet: Address)
        -> SweeperResult<Option<WatchSession>>;

    async fn active_sessions(&self) -> SweeperResult<Vec<WatchSession>>;

    /// Append a record. Returns `false` when a record with the same
    /// `(session_id, source_id)` already exists and nothing was written.
    async fn record_transfer(&self, record: NewTransferRecord) -> SweeperResult<bool>;

    /// Most-recent-first page of transfer records
    async fn list_transfers(&self, filter: TransferFilter) -> SweeperResult<Vec<TransferRecord>>;

    /// Every session watching the wallet and every record touching it
    async fn snapshot_for_wallet(&self, wallet: Address) -> SweeperResult<WalletSnapshot>;

    /// Remove everything [`snapshot_for_wallet`](Self::snapshot_for_wallet)
    /// returns, as one atomic unit
    async fn delete_all_for_wallet(&self, wallet: Address) -> SweeperResult<ErasedWallet>;

    async fn health_check(&self) -> SweeperResult<()>;
}
