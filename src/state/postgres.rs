//! PostgreSQL session store

use super::models::{
    ErasedWallet, NewSession, NewTransferRecord, RecordKind, SessionStatus, TransferFilter,
    TransferMode, TransferRecord, WalletSnapshot, WatchSession,
};
use super::store::SessionStore;
use crate::config::DatabaseConfig;
use crate::error::{SweeperError, SweeperResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

const SESSION_COLUMNS: &str = "id, watched_address, destination_address, status, started_at, \
     stopped_at, transfer_mode, minimum_balance, tracked_tokens, gas_sponsored, warpcast_fid";

const TRANSFER_COLUMNS: &str = "id, session_id, from_address, to_address, token_address, \
     amount, tx_hash, kind, message, source_id, created_at";

/// Session store for PostgreSQL persistence
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Create a new store and connect the pool
    pub async fn new(config: &DatabaseConfig) -> SweeperResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Shared pool, also used by the Postgres idempotency store
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SweeperResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watch_sessions (
                id UUID PRIMARY KEY,
                watched_address VARCHAR(42) NOT NULL,
                destination_address VARCHAR(42) NOT NULL,
                status VARCHAR(10) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                stopped_at TIMESTAMPTZ,
                transfer_mode VARCHAR(20) NOT NULL,
                minimum_balance TEXT,
                tracked_tokens TEXT[] NOT NULL DEFAULT '{}',
                gas_sponsored BOOLEAN NOT NULL DEFAULT FALSE,
                warpcast_fid BIGINT,
                CHECK (watched_address <> destination_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one Active session per watched wallet
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
            ON watch_sessions (watched_address)
            WHERE status = 'active'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id UUID PRIMARY KEY,
                session_id UUID,
                from_address VARCHAR(42),
                to_address VARCHAR(42),
                token_address VARCHAR(42),
                amount TEXT,
                tx_hash VARCHAR(66),
                kind VARCHAR(20) NOT NULL,
                message TEXT,
                source_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transfers_source
            ON transfers (session_id, source_id)
            WHERE source_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_session_created
            ON transfers (session_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_session(&self, new: NewSession) -> SweeperResult<WatchSession> {
        if new.watched_address == new.destination_address {
            return Err(SweeperError::Validation(
                "Watched cannot equal Destination.".to_string(),
            ));
        }

        let session = new.into_session();
        let tokens: Vec<String> = session.tracked_tokens.iter().map(addr_to_db).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO watch_sessions
                (id, watched_address, destination_address, status, started_at,
                 transfer_mode, minimum_balance, tracked_tokens, gas_sponsored, warpcast_fid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(session.id)
        .bind(addr_to_db(&session.watched_address))
        .bind(addr_to_db(&session.destination_address))
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(session.transfer_mode.name())
        .bind(session.transfer_mode.minimum().map(|m| m.to_string()))
        .bind(&tokens)
        .bind(session.gas_sponsored)
        .bind(session.warpcast_fid.map(|f| f as i64))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Created session {} for {:?}", session.id, session.watched_address);
                Ok(session)
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(SweeperError::Conflict(
                    "Wallet is already being watched.".to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>> {
        sqlx::query(
            r#"
            UPDATE watch_sessions
            SET status = 'stopped', stopped_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_session(id).await
    }

    async fn get_session(&self, id: Uuid) -> SweeperResult<Option<WatchSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM watch_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn latest_session_for_wallet(
        &self,
        wallet: Address,
    ) -> SweeperResult<Option<WatchSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM watch_sessions WHERE watched_address = $1 \
             ORDER BY started_at DESC LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(addr_to_db(&wallet))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn active_sessions(&self) -> SweeperResult<Vec<WatchSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM watch_sessions WHERE status = 'active'",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    async fn record_transfer(&self, record: NewTransferRecord) -> SweeperResult<bool> {
        let record = record.into_record();

        let result = sqlx::query(
            r#"
            INSERT INTO transfers
                (id, session_id, from_address, to_address, token_address,
                 amount, tx_hash, kind, message, source_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.session_id)
        .bind(record.from_address.as_ref().map(addr_to_db))
        .bind(record.to_address.as_ref().map(addr_to_db))
        .bind(record.token_address.as_ref().map(addr_to_db))
        .bind(record.amount.map(|a| a.to_string()))
        .bind(&record.tx_hash)
        .bind(record.kind.as_str())
        .bind(&record.message)
        .bind(&record.source_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_transfers(&self, filter: TransferFilter) -> SweeperResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transfers \
             WHERE ($1::UUID IS NULL OR session_id = $1) \
             ORDER BY created_at DESC LIMIT $2",
            TRANSFER_COLUMNS
        ))
        .bind(filter.session_id)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transfer_from_row).collect()
    }

    async fn snapshot_for_wallet(&self, wallet: Address) -> SweeperResult<WalletSnapshot> {
        let wallet_db = addr_to_db(&wallet);

        // Repeatable read so sessions and transfers come from one snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let session_rows = sqlx::query(&format!(
            "SELECT {} FROM watch_sessions WHERE watched_address = $1 ORDER BY started_at",
            SESSION_COLUMNS
        ))
        .bind(&wallet_db)
        .fetch_all(&mut *tx)
        .await?;

        let transfer_rows = sqlx::query(&format!(
            "SELECT {} FROM transfers \
             WHERE from_address = $1 OR to_address = $1 \
                OR session_id IN (SELECT id FROM watch_sessions WHERE watched_address = $1) \
             ORDER BY created_at",
            TRANSFER_COLUMNS
        ))
        .bind(&wallet_db)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(WalletSnapshot {
            wallet,
            exported_at: Utc::now(),
            sessions: session_rows
                .iter()
                .map(session_from_row)
                .collect::<SweeperResult<_>>()?,
            transactions: transfer_rows
                .iter()
                .map(transfer_from_row)
                .collect::<SweeperResult<_>>()?,
        })
    }

    async fn delete_all_for_wallet(&self, wallet: Address) -> SweeperResult<ErasedWallet> {
        let wallet_db = addr_to_db(&wallet);
        let mut tx = self.pool.begin().await?;

        let transfers = sqlx::query(
            r#"
            DELETE FROM transfers
            WHERE from_address = $1 OR to_address = $1
               OR session_id IN (SELECT id FROM watch_sessions WHERE watched_address = $1)
            "#,
        )
        .bind(&wallet_db)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let session_ids: Vec<Uuid> =
            sqlx::query("DELETE FROM watch_sessions WHERE watched_address = $1 RETURNING id")
                .bind(&wallet_db)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| row.try_get::<Uuid, _>("id"))
                .collect::<Result<_, _>>()?;

        tx.commit().await?;

        info!(
            "Erased {} sessions and {} transfers for {:?}",
            session_ids.len(),
            transfers,
            wallet
        );
        Ok(ErasedWallet {
            session_ids,
            transfers,
        })
    }

    async fn health_check(&self) -> SweeperResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Addresses are stored as lowercase 0x-prefixed hex
fn addr_to_db(addr: &Address) -> String {
    format!("{:?}", addr)
}

fn addr_from_db(raw: &str) -> SweeperResult<Address> {
    raw.parse()
        .map_err(|e| SweeperError::Internal(format!("Corrupt address {:?} in store: {}", raw, e)))
}

fn opt_addr_from_db(raw: Option<String>) -> SweeperResult<Option<Address>> {
    raw.as_deref().map(addr_from_db).transpose()
}

fn session_from_row(row: &PgRow) -> SweeperResult<WatchSession> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("transfer_mode")?;
    let minimum: Option<String> = row.try_get("minimum_balance")?;
    let tokens: Vec<String> = row.try_get("tracked_tokens")?;
    let fid: Option<i64> = row.try_get("warpcast_fid")?;
    let stopped_at: Option<DateTime<Utc>> = row.try_get("stopped_at")?;

    Ok(WatchSession {
        id: row.try_get("id")?,
        watched_address: addr_from_db(&row.try_get::<String, _>("watched_address")?)?,
        destination_address: addr_from_db(&row.try_get::<String, _>("destination_address")?)?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| SweeperError::Internal(format!("Unknown session status {}", status)))?,
        started_at: row.try_get("started_at")?,
        stopped_at,
        transfer_mode: TransferMode::from_parts(&mode, minimum.as_deref())
            .ok_or_else(|| SweeperError::Internal(format!("Unknown transfer mode {}", mode)))?,
        tracked_tokens: tokens
            .iter()
            .map(|t| addr_from_db(t))
            .collect::<SweeperResult<_>>()?,
        gas_sponsored: row.try_get("gas_sponsored")?,
        warpcast_fid: fid.map(|f| f as u64),
    })
}

fn transfer_from_row(row: &PgRow) -> SweeperResult<TransferRecord> {
    let kind: String = row.try_get("kind")?;
    let amount: Option<String> = row.try_get("amount")?;

    Ok(TransferRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        from_address: opt_addr_from_db(row.try_get("from_address")?)?,
        to_address: opt_addr_from_db(row.try_get("to_address")?)?,
        token_address: opt_addr_from_db(row.try_get("token_address")?)?,
        amount: amount
            .as_deref()
            .map(U256::from_dec_str)
            .transpose()
            .map_err(|e| SweeperError::Internal(format!("Corrupt amount in store: {}", e)))?,
        tx_hash: row.try_get("tx_hash")?,
        kind: RecordKind::parse(&kind)
            .ok_or_else(|| SweeperError::Internal(format!("Unknown record kind {}", kind)))?,
        message: row.try_get("message")?,
        source_id: row.try_get("source_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_db_format_round_trips() {
        let addr: Address = "0xD8900C1b8610A27300ED68C3A248b44616155d37".parse().unwrap();
        let stored = addr_to_db(&addr);
        assert_eq!(stored, "0xd8900c1b8610a27300ed68c3a248b44616155d37");
        assert_eq!(addr_from_db(&stored).unwrap(), addr);
        assert!(addr_from_db("not-an-address").is_err());
    }

    /// Requires a reachable database in `SWEEPER_TEST_DATABASE_URL`
    #[tokio::test]
    #[ignore]
    async fn test_one_active_session_enforced_by_index() {
        let url = std::env::var("SWEEPER_TEST_DATABASE_URL").unwrap();
        let store = PgSessionStore::new(&DatabaseConfig {
            url,
            max_connections: 4,
            min_connections: 1,
        })
        .await
        .unwrap();
        store.run_migrations().await.unwrap();

        let watched = Address::random();
        let new = |dest: Address| NewSession {
            watched_address: watched,
            destination_address: dest,
            transfer_mode: TransferMode::ZeroOut,
            tracked_tokens: vec![],
            gas_sponsored: false,
            warpcast_fid: None,
        };

        let (a, b) = tokio::join!(
            store.create_session(new(Address::random())),
            store.create_session(new(Address::random()))
        );
        assert!(a.is_ok() ^ b.is_ok());

        store.delete_all_for_wallet(watched).await.unwrap();
        assert!(store.snapshot_for_wallet(watched).await.unwrap().is_empty());
    }
}
