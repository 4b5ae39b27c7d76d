//! Idempotency guard wrapping a mutating handler

use super::store::{CachedResponse, IdempotencyStore, Reservation, MAX_CACHED_BODY};
use crate::config::IdempotencyConfig;
use crate::error::SweeperResult;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(25);

/// What the guard did with a request
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// The handler ran (no key, first request, or previous attempt failed)
    Executed(CachedResponse),
    /// A previous request with the same key already succeeded
    Replayed(CachedResponse),
    /// A request with the same key is still running past the wait bound
    InProgress,
}

impl IntoResponse for GuardOutcome {
    fn into_response(self) -> Response {
        match self {
            GuardOutcome::Executed(response) => response.into_response(),
            GuardOutcome::Replayed(cached) => {
                let mut body = cached.json_object().unwrap_or_default();
                body.insert("error".to_string(), json!("Duplicate request"));
                (StatusCode::CONFLICT, Json(serde_json::Value::Object(body))).into_response()
            }
            GuardOutcome::InProgress => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "Request in progress" })),
            )
                .into_response(),
        }
    }
}

/// A reserved key that is released if the request is dropped before it
/// settles, e.g. when the client disconnects
struct Reserved {
    store: Arc<dyn IdempotencyStore>,
    key: String,
    armed: bool,
}

impl Reserved {
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for Reserved {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Request for key {} abandoned; releasing", key);
                handle.spawn(async move {
                    if let Err(e) = store.release(&key).await {
                        error!("Failed to release idempotency key {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("Idempotency key {} held until expiry", key),
        }
    }
}

/// Runs a handler at most once per key within the TTL window
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    in_flight_wait: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: &IdempotencyConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.ttl_secs),
            in_flight_wait: Duration::from_millis(config.in_flight_wait_ms),
        }
    }

    /// Run `handler` unless `key` has already been used.
    ///
    /// Only successful (2xx) responses up to [`MAX_CACHED_BODY`] are cached.
    /// Any other outcome, including the request being dropped, releases the
    /// key so a retry can execute.
    pub async fn execute<F, Fut>(&self, key: Option<&str>, handler: F) -> SweeperResult<GuardOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResponse>,
    {
        let Some(key) = key else {
            return Ok(GuardOutcome::Executed(handler().await));
        };

        let deadline = Instant::now() + self.in_flight_wait;
        loop {
            match self.store.reserve(key, self.ttl).await? {
                Reservation::Acquired => break,
                Reservation::Completed(cached) => {
                    info!("Replaying cached response for idempotency key {}", key);
                    crate::metrics::record_idempotency_replay();
                    return Ok(GuardOutcome::Replayed(cached));
                }
                Reservation::InFlight => {
                    if Instant::now() >= deadline {
                        return Ok(GuardOutcome::InProgress);
                    }
                    tokio::time::sleep(IN_FLIGHT_POLL).await;
                }
            }
        }

        let reserved = Reserved {
            store: self.store.clone(),
            key: key.to_string(),
            armed: true,
        };

        let response = handler().await;

        if response.is_cacheable() {
            if let Err(e) = self.store.complete(key, response.clone(), self.ttl).await {
                // The side effect already happened; the response still goes out
                error!("Failed to cache response for key {}: {}", key, e);
            }
        } else {
            if response.is_success() {
                warn!(
                    "Response for key {} is {} bytes, over the {} byte cache limit; releasing",
                    key,
                    response.body.len(),
                    MAX_CACHED_BODY
                );
            } else {
                debug!(
                    "Not caching status {} for key {}; releasing",
                    response.status, key
                );
            }
            if let Err(e) = self.store.release(key).await {
                error!("Failed to release idempotency key {}: {}", key, e);
            }
        }
        reserved.settle();

        Ok(GuardOutcome::Executed(response))
    }

    /// Periodically drop expired keys until the task is aborted
    pub async fn run_eviction(&self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match self.store.evict_expired().await {
                Ok(0) => {}
                Ok(n) => debug!("Evicted {} expired idempotency keys", n),
                Err(e) => error!("Idempotency eviction failed: {}", e),
            }
        }
    }
}
