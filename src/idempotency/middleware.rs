//! axum middleware applying the idempotency guard to mutating routes

use super::guard::IdempotencyGuard;
use super::store::CachedResponse;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Keys are scoped to the route so the same client token on two endpoints
/// does not collide
fn scoped_key(method: &Method, path: &str, headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(IDEMPOTENCY_HEADER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(format!("{} {} {}", method, path, raw))
}

/// Wraps the downstream handler: a keyed response is captured, stored under
/// the key and then emitted. Requests without a key pass straight through.
pub async fn idempotency_middleware(
    State(guard): State<Arc<IdempotencyGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let key = if is_mutating(request.method()) {
        scoped_key(request.method(), request.uri().path(), request.headers())
    } else {
        None
    };
    let Some(key) = key else {
        return next.run(request).await;
    };

    let outcome = guard
        .execute(Some(key.as_str()), || async move {
            CachedResponse::capture(next.run(request).await).await
        })
        .await;

    match outcome {
        Ok(outcome) => outcome.into_response(),
        Err(e) => e.into_response(),
    }
}
