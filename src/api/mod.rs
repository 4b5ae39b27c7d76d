//! HTTP API: watch lifecycle, activity log, revocation and health checks

use crate::config::ServerConfig;
use crate::error::{SweeperError, SweeperResult};
use crate::idempotency::{idempotency_middleware, IdempotencyGuard, IDEMPOTENCY_HEADER};
use crate::revoke::{Delivered, DeliveryMode, RevocationService};
use crate::state::SessionStore;
use crate::watch::{
    LogEntryRequest, StartWatchingRequest, StopOutcome, StopWatchingRequest, UnwatchRequest,
    WatchRequest, WatchService,
};

use axum::{
    extract::{Query, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub watch: Arc<WatchService>,
    pub revocation: Arc<RevocationService>,
    pub store: Arc<dyn SessionStore>,
}

/// Build the application router
pub fn router(
    state: AppState,
    guard: Arc<IdempotencyGuard>,
    frontend_origin: Option<&str>,
) -> SweeperResult<Router> {
    let origin = match frontend_origin {
        Some(origin) => AllowOrigin::exact(HeaderValue::from_str(origin).map_err(|e| {
            SweeperError::Config(format!("Invalid frontend origin {}: {}", origin, e))
        })?),
        None => AllowOrigin::from(Any),
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("idempotency-key"),
        ])
        .expose_headers([header::CONTENT_DISPOSITION]);

    Ok(Router::new()
        .route("/watch", post(watch))
        .route("/unwatch", post(unwatch))
        .route("/start-watching", post(start_watching))
        .route("/stop-watching", post(stop_watching))
        .route("/logs", get(list_logs))
        .route("/log", get(session_log).post(append_log))
        .route("/revoke", post(revoke))
        .layer(axum::middleware::from_fn_with_state(
            guard,
            idempotency_middleware,
        ))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Run the HTTP API server
pub async fn run_server(
    config: ServerConfig,
    state: AppState,
    guard: Arc<IdempotencyGuard>,
) -> SweeperResult<()> {
    let app = router(state, guard, config.frontend_origin.as_deref())?;

    let addr = format!("{}:{}", config.host, config.port);
    info!(
        "Starting API server on {} ({} honored on POST routes)",
        addr, IDEMPOTENCY_HEADER
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - the store must answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: store_ok,
            store: store_ok,
        }),
    )
}

async fn watch(
    State(state): State<AppState>,
    Json(request): Json<WatchRequest>,
) -> SweeperResult<impl IntoResponse> {
    let started = state.watch.watch(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "type": "success",
            "message": format!("Now watching {}", started.watched),
            "sessionId": started.session_id,
            "watched": started.watched,
            "destination": started.destination,
        })),
    ))
}

async fn unwatch(
    State(state): State<AppState>,
    Json(request): Json<UnwatchRequest>,
) -> SweeperResult<impl IntoResponse> {
    let watched = request.watched.clone().unwrap_or_default();
    let stopped = state.watch.unwatch(request).await?;
    Ok(Json(json!({
        "type": "success",
        "message": format!("Stopped watching {}", watched.trim()),
        "stopped": stopped,
    })))
}

async fn start_watching(
    State(state): State<AppState>,
    Json(request): Json<StartWatchingRequest>,
) -> SweeperResult<impl IntoResponse> {
    Ok(Json(state.watch.start(request).await?))
}

async fn stop_watching(
    State(state): State<AppState>,
    Json(request): Json<StopWatchingRequest>,
) -> SweeperResult<impl IntoResponse> {
    let body = match state.watch.stop(request).await? {
        StopOutcome::Stopped => json!({ "stopped": true }),
        StopOutcome::Revoked => json!({ "revoked": true }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    session_id: Option<String>,
    limit: Option<usize>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> SweeperResult<impl IntoResponse> {
    Ok(Json(state.watch.list_transfers(None, query.limit).await?))
}

async fn session_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> SweeperResult<impl IntoResponse> {
    let raw = query
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SweeperError::Validation("sessionId is required".to_string()))?;
    let session_id = Uuid::parse_str(raw)
        .map_err(|_| SweeperError::Validation("Invalid sessionId".to_string()))?;

    let logs = state
        .watch
        .list_transfers(Some(session_id), query.limit)
        .await?;
    Ok(Json(json!({ "logs": logs })))
}

async fn append_log(
    State(state): State<AppState>,
    Json(request): Json<LogEntryRequest>,
) -> SweeperResult<impl IntoResponse> {
    state.watch.append_log(request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true }))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeRequest {
    wallet_address: Option<String>,
    farcaster_fid: Option<Value>,
}

impl RevokeRequest {
    fn parse(&self) -> SweeperResult<(ethers::types::Address, DeliveryMode)> {
        let wallet = self
            .wallet_address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SweeperError::Validation("walletAddress required".to_string()))?;
        let wallet = crate::chain::parse_address(wallet).ok_or_else(|| {
            SweeperError::Validation("Invalid Ethereum address provided".to_string())
        })?;

        let mode = match &self.farcaster_fid {
            None | Some(Value::Null) => DeliveryMode::Download,
            Some(Value::Number(n)) => match n.as_u64() {
                Some(fid) if fid > 0 => DeliveryMode::Farcaster { fid },
                _ => return Err(invalid_fid()),
            },
            Some(Value::String(s)) => match s.trim().parse::<u64>() {
                Ok(fid) if fid > 0 => DeliveryMode::Farcaster { fid },
                _ => return Err(invalid_fid()),
            },
            Some(_) => return Err(invalid_fid()),
        };

        Ok((wallet, mode))
    }
}

fn invalid_fid() -> SweeperError {
    SweeperError::Validation("Invalid Farcaster FID.".to_string())
}

async fn revoke(State(state): State<AppState>, Json(request): Json<RevokeRequest>) -> Response {
    let (wallet, mode) = match request.parse() {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    match state.revocation.revoke(wallet, mode).await {
        Ok(Delivered::Download { file_name, body }) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file_name),
                ),
            ],
            body,
        )
            .into_response(),
        Ok(Delivered::Farcaster { .. }) => {
            Json(json!({ "success": true, "farcaster": true })).into_response()
        }
        // Detail was logged by the service
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "type": "error", "error": "Failed to revoke and export user data." })),
        )
            .into_response(),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validator::{MockChainEndpoint, MockNameResolver};
    use crate::chain::{ChainEndpoint, ChainValidator, MockChainDataProvider};
    use crate::config::{IdempotencyConfig, WatcherConfig};
    use crate::farcaster::WarpcastClient;
    use crate::idempotency::{MemoryIdempotencyStore, MAX_CACHED_BODY};
    use crate::state::{MemorySessionStore, NewTransferRecord, RecordKind};
    use crate::tx::MockTransferExecutor;
    use crate::watch::WatchScheduler;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const WATCHED: &str = "0x1111111111111111111111111111111111111111";
    const DEST: &str = "0x2222222222222222222222222222222222222222";

    struct TestApp {
        router: Router,
        scheduler: Arc<WatchScheduler>,
        store: Arc<MemorySessionStore>,
        _export_dir: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let store = Arc::new(MemorySessionStore::new());

        let mut endpoint = MockChainEndpoint::new();
        endpoint.expect_label().returning(|| "mock".to_string());
        endpoint.expect_has_activity().returning(|_| Ok(true));
        let endpoints: Vec<Arc<dyn ChainEndpoint>> = vec![Arc::new(endpoint)];
        let mut resolver = MockNameResolver::new();
        resolver.expect_resolve().returning(|_| Ok(None));
        let validator = Arc::new(ChainValidator::new(
            Arc::new(resolver),
            endpoints,
            vec![".eth".to_string()],
            Duration::from_secs(1),
        ));

        let scheduler = Arc::new(WatchScheduler::new(
            store.clone(),
            Arc::new(MockChainDataProvider::new()),
            Arc::new(MockTransferExecutor::new()),
            &WatcherConfig {
                poll_interval_ms: 600_000,
                poll_timeout_ms: 1_000,
                data_rpc_url: "http://localhost".to_string(),
                max_transfers_per_poll: 100,
                max_page_size: 2,
                shutdown_grace_ms: 1_000,
            },
        ));
        let watch = Arc::new(WatchService::new(
            validator,
            store.clone(),
            scheduler.clone(),
            WarpcastClient::new("http://127.0.0.1:9").unwrap(),
            2,
        ));
        let export_dir = tempfile::tempdir().unwrap();
        let revocation = Arc::new(RevocationService::new(
            store.clone(),
            scheduler.clone(),
            None,
            Some(export_dir.path().to_path_buf()),
        ));
        let guard = Arc::new(IdempotencyGuard::new(
            Arc::new(MemoryIdempotencyStore::new()),
            &IdempotencyConfig::default(),
        ));

        let state = AppState {
            watch,
            revocation,
            store: store.clone(),
        };
        TestApp {
            router: router(state, guard, Some("https://wally.example")).unwrap(),
            scheduler,
            store,
            _export_dir: export_dir,
        }
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_watch_equal_fields_is_bad_request() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post("/watch", json!({ "watched": "0xA", "destination": "0xA" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Watched cannot equal Destination.");
    }

    #[tokio::test]
    async fn test_watch_then_conflict() {
        let app = app();
        let request = || post("/watch", json!({ "watched": WATCHED, "destination": DEST }));

        let (status, body) = send(&app.router, request()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["type"], "success");

        let (status, body) = send(&app.router, request()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Config already exists.");

        let (status, _) = send(&app.router, post("/unwatch", json!({ "watched": WATCHED }))).await;
        assert_eq!(status, StatusCode::OK);
        app.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_watching_replays_with_idempotency_key() {
        let app = app();
        let request = || {
            Request::builder()
                .method(Method::POST)
                .uri("/start-watching")
                .header(header::CONTENT_TYPE, "application/json")
                .header(IDEMPOTENCY_HEADER, "retry-1")
                .body(Body::from(
                    json!({ "walletAddress": WATCHED, "destinationAddress": DEST }).to_string(),
                ))
                .unwrap()
        };

        let (status, first) = send(&app.router, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["isGasSponsored"], false);

        let (status, second) = send(&app.router, request()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(second["sessionId"], first["sessionId"]);
        assert_eq!(app.store.active_sessions().await.unwrap().len(), 1);
        app.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_watching_unknown_wallet_is_not_found() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post("/stop-watching", json!({ "walletAddress": WATCHED })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No active session found");

        let (status, body) = send(&app.router, post("/stop-watching", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "walletAddress required");
    }

    #[tokio::test]
    async fn test_logs_are_capped_and_session_log_needs_id() {
        let app = app();
        for i in 0..3 {
            let (status, _) = send(
                &app.router,
                post("/log", json!({ "type": "log", "message": format!("m{}", i) })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = send(&app.router, get_req("/logs?limit=50")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = send(&app.router, get_req("/log")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "sessionId is required");

        let uri = format!("/log?sessionId={}", Uuid::new_v4());
        let (status, body) = send(&app.router, get_req(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_download() {
        let app = app();
        send(
            &app.router,
            post(
                "/start-watching",
                json!({ "walletAddress": WATCHED, "destinationAddress": DEST }),
            ),
        )
        .await;

        let response = app
            .router
            .clone()
            .oneshot(post("/revoke", json!({ "walletAddress": WATCHED })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains(&format!("wally_data_{}.json", "1".repeat(40))));

        assert!(app.store.active_sessions().await.unwrap().is_empty());
        assert_eq!(app.scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_revoke_download_larger_than_replay_cache() {
        let app = app();
        let wallet = crate::chain::parse_address(WATCHED).unwrap();
        for i in 0..5 {
            app.store
                .record_transfer(NewTransferRecord {
                    from_address: Some(wallet),
                    kind: Some(RecordKind::Log),
                    message: Some(format!("{}{}", i, "a".repeat(1024 * 1024))),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let response = app
            .router
            .clone()
            .oneshot(post("/revoke", json!({ "walletAddress": WATCHED })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.len() > MAX_CACHED_BODY);

        let export: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(export["transactions"].as_array().unwrap().len(), 5);
        assert!(app
            .store
            .snapshot_for_wallet(wallet)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_revoke_failure_is_generic() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post("/revoke", json!({ "walletAddress": WATCHED, "farcasterFid": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to revoke and export user data.");

        let (status, body) = send(&app.router, post("/revoke", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "walletAddress required");
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = app();
        let (status, body) = send(&app.router, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app.router, get_req("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }
}
