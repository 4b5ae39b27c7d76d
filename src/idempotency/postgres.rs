//! Shared idempotency store for multi-instance deployments

use super::store::{CachedResponse, IdempotencyStore, Reservation};
use crate::error::{SweeperError, SweeperResult};

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tracing::info;

/// Key store backed by a Postgres table; reservation is a single
/// `INSERT .. ON CONFLICT DO NOTHING`
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> SweeperResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                status_code INTEGER,
                headers TEXT,
                body BYTEA,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Idempotency table ready");
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn reserve(&self, key: &str, ttl: Duration) -> SweeperResult<Reservation> {
        let ttl_secs = ttl.as_secs_f64();

        // An expired row is replaced in the same statement that claims the key
        let claimed = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, expires_at)
            VALUES ($1, NOW() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
                SET status_code = NULL, headers = NULL, body = NULL,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_keys.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(ttl_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 1 {
            return Ok(Reservation::Acquired);
        }

        let row = sqlx::query(
            "SELECT status_code, headers, body FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            // Released between the two statements; the caller retries
            return Ok(Reservation::InFlight);
        };

        let status: Option<i32> = row.try_get("status_code")?;
        let Some(status) = status else {
            return Ok(Reservation::InFlight);
        };

        let headers: Option<String> = row.try_get("headers")?;
        let headers = match headers {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let body: Option<Vec<u8>> = row.try_get("body")?;

        Ok(Reservation::Completed(CachedResponse {
            status: u16::try_from(status)
                .map_err(|_| SweeperError::Internal(format!("Bad cached status {}", status)))?,
            headers,
            body: body.unwrap_or_default(),
        }))
    }

    async fn complete(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> SweeperResult<()> {
        let headers = serde_json::to_string(&response.headers)?;

        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status_code = $2, headers = $3, body = $4,
                expires_at = NOW() + make_interval(secs => $5)
            WHERE key = $1 AND status_code IS NULL
            "#,
        )
        .bind(key)
        .bind(response.status as i32)
        .bind(headers)
        .bind(response.body)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(&self, key: &str) -> SweeperResult<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND status_code IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict_expired(&self) -> SweeperResult<usize> {
        let removed = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed as usize)
    }
}
