//! Idempotency key storage boundary

use crate::error::SweeperResult;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Larger responses are still returned, but not kept for replay
pub const MAX_CACHED_BODY: usize = 4 * 1024 * 1024;

/// Headers carried along with a cached body
const CACHED_HEADERS: [HeaderName; 2] = [header::CONTENT_TYPE, header::CONTENT_DISPOSITION];

/// A completed response captured for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self {
            status: status.as_u16(),
            headers: vec![(
                header::CONTENT_TYPE.to_string(),
                "application/json".to_string(),
            )],
            body: value.to_string().into_bytes(),
        }
    }

    /// Buffer a handler response so it can be both returned and cached.
    /// Handler bodies are already in memory, so the whole body is kept.
    pub async fn capture(response: Response) -> Self {
        let (parts, body) = response.into_parts();

        let headers = CACHED_HEADERS
            .iter()
            .filter_map(|name| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => Self {
                status: parts.status.as_u16(),
                headers,
                body: bytes.to_vec(),
            },
            Err(e) => {
                tracing::error!("Failed to buffer response body: {}", e);
                Self::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &serde_json::json!({ "type": "error", "error": "Request failed. Please try again." }),
                )
            }
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Successful and small enough to keep
    pub fn is_cacheable(&self) -> bool {
        self.is_success() && self.body.len() <= MAX_CACHED_BODY
    }

    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name.as_str()))
            .map(|(_, v)| v.as_str())
    }

    /// Cached JSON object payload, if the body is one
    pub fn json_object(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let is_json = self
            .header(&header::CONTENT_TYPE)
            .map_or(false, |ct| ct.starts_with("application/json"));
        if !is_json {
            return None;
        }

        match serde_json::from_slice(&self.body).ok()? {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }

        response
    }
}

/// Result of trying to claim a key
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and must `complete` or `release` it
    Acquired,
    /// Another request with this key is still running
    InFlight,
    /// A previous request with this key finished successfully
    Completed(CachedResponse),
}

/// Process-wide key store.
///
/// `reserve` must be a single atomic insert-if-absent so that exactly one
/// concurrent caller observes `Acquired` for a live key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn reserve(&self, key: &str, ttl: Duration) -> SweeperResult<Reservation>;

    /// Publish the response for a reserved key
    async fn complete(&self, key: &str, response: CachedResponse, ttl: Duration)
        -> SweeperResult<()>;

    /// Drop a reservation whose handler did not succeed
    async fn release(&self, key: &str) -> SweeperResult<()>;

    /// Remove expired entries, returning how many were dropped
    async fn evict_expired(&self) -> SweeperResult<usize>;
}
