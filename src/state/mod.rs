//! Session and transfer persistence
//!
//! Handles:
//! - Watch session lifecycle records (one Active session per watched wallet)
//! - Append-only transfer and activity log records
//! - Atomic per-wallet erasure for revocation
//!
//! Two backends implement [`SessionStore`]: PostgreSQL for deployments and an
//! in-process store for single-node runs and tests.

mod memory;
mod models;
mod postgres;
mod store;

pub use memory::MemorySessionStore;
pub use models::{
    ErasedWallet, NewSession, NewTransferRecord, RecordKind, SessionStatus, TransferFilter,
    TransferMode, TransferRecord, WalletSnapshot, WatchSession,
};
pub use postgres::PgSessionStore;
pub use store::SessionStore;
