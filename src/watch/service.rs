//! Request-level watch operations
//!
//! Input checks happen here, before anything reaches the store. The store
//! still enforces its own rules (one Active session per wallet, watched
//! differs from destination) atomically.

use super::scheduler::WatchScheduler;
use crate::chain::{display_address, parse_address, ChainValidator};
use crate::error::{SweeperError, SweeperResult};
use crate::farcaster::WarpcastClient;
use crate::state::{
    NewSession, NewTransferRecord, RecordKind, SessionStore, TransferFilter, TransferMode,
    TransferRecord, WatchSession,
};

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// `POST /watch`
#[derive(Debug, Default, Deserialize)]
pub struct WatchRequest {
    pub watched: Option<String>,
    pub destination: Option<String>,
}

/// `POST /unwatch`
#[derive(Debug, Default, Deserialize)]
pub struct UnwatchRequest {
    pub watched: Option<String>,
}

/// `POST /start-watching`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWatchingRequest {
    pub wallet_address: Option<String>,
    pub destination_address: Option<String>,
    /// Number or numeric string
    pub warpcast_fid: Option<Value>,
    pub token_addresses: Option<Value>,
    pub transfer_mode: Option<String>,
    /// Smallest-unit amount, as a decimal string or number
    pub minimum_balance: Option<Value>,
}

/// `POST /stop-watching`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopWatchingRequest {
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub revoke: bool,
}

/// `POST /log`
#[derive(Debug, Default, Deserialize)]
pub struct LogEntryRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStarted {
    pub watched: String,
    pub destination: String,
    #[serde(skip)]
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: Uuid,
    pub is_gas_sponsored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    Revoked,
}

fn blank(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub struct WatchService {
    validator: Arc<ChainValidator>,
    store: Arc<dyn SessionStore>,
    scheduler: Arc<WatchScheduler>,
    warpcast: WarpcastClient,
    max_page_size: usize,
}

impl WatchService {
    pub fn new(
        validator: Arc<ChainValidator>,
        store: Arc<dyn SessionStore>,
        scheduler: Arc<WatchScheduler>,
        warpcast: WarpcastClient,
        max_page_size: usize,
    ) -> Self {
        Self {
            validator,
            store,
            scheduler,
            warpcast,
            max_page_size: max_page_size.max(1),
        }
    }

    /// Watch with the simple schema: zero-out, native asset, no sponsorship.
    /// Names are resolved.
    pub async fn watch(&self, request: WatchRequest) -> SweeperResult<WatchStarted> {
        let (Some(watched), Some(destination)) = (blank(&request.watched), blank(&request.destination))
        else {
            return Err(SweeperError::Validation("Fields cannot be blank.".to_string()));
        };
        if watched.eq_ignore_ascii_case(destination) {
            return Err(SweeperError::Validation(
                "Watched cannot equal Destination.".to_string(),
            ));
        }

        let (watched_address, destination_address) =
            self.validate_pair(watched, destination).await?;

        let session = self
            .create(NewSession {
                watched_address,
                destination_address,
                transfer_mode: TransferMode::ZeroOut,
                tracked_tokens: Vec::new(),
                gas_sponsored: false,
                warpcast_fid: None,
            })
            .await
            .map_err(|e| match e {
                SweeperError::Conflict(_) => {
                    SweeperError::Conflict("Config already exists.".to_string())
                }
                other => other,
            })?;

        Ok(WatchStarted {
            watched: display_address(&session.watched_address),
            destination: display_address(&session.destination_address),
            session_id: session.id,
        })
    }

    /// Stop every Active session for the wallet. Returns how many were stopped.
    pub async fn unwatch(&self, request: UnwatchRequest) -> SweeperResult<usize> {
        let Some(watched) = blank(&request.watched) else {
            return Err(SweeperError::Validation(
                "Watched wallet address is required.".to_string(),
            ));
        };

        let wallet = match parse_address(watched) {
            Some(address) => address,
            None if self.validator.is_name(watched) => {
                match self.validator.validate(watched).await.resolved_address {
                    Some(address) => address,
                    None => return Ok(0),
                }
            }
            None => {
                return Err(SweeperError::Validation(format!(
                    "Invalid wallet/ENS: {}",
                    watched
                )))
            }
        };

        let sessions: Vec<WatchSession> = self
            .store
            .active_sessions()
            .await?
            .into_iter()
            .filter(|s| s.watched_address == wallet)
            .collect();

        for session in &sessions {
            self.scheduler.stop_watching(session.id, false).await?;
            self.store.stop_session(session.id).await?;
        }

        info!("Unwatched {:?}: {} sessions stopped", wallet, sessions.len());
        Ok(sessions.len())
    }

    /// Start a session with the full schema
    pub async fn start(&self, request: StartWatchingRequest) -> SweeperResult<StartedSession> {
        let (Some(wallet), Some(destination)) = (
            blank(&request.wallet_address),
            blank(&request.destination_address),
        ) else {
            return Err(SweeperError::Validation(
                "walletAddress and destinationAddress are required".to_string(),
            ));
        };

        let (Some(wallet_address), Some(destination_address)) =
            (parse_address(wallet), parse_address(destination))
        else {
            return Err(SweeperError::Validation(
                "Invalid Ethereum address provided".to_string(),
            ));
        };

        let tracked_tokens = parse_tokens(request.token_addresses.as_ref())?;
        let transfer_mode = parse_mode(
            request.transfer_mode.as_deref(),
            request.minimum_balance.as_ref(),
        )?;

        let warpcast_fid = request
            .warpcast_fid
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| parse_fid(v).ok_or_else(invalid_fid))
            .transpose()?;

        if wallet_address == destination_address {
            return Err(SweeperError::Validation(
                "Watched cannot equal Destination.".to_string(),
            ));
        }
        self.validate_pair(wallet, destination).await?;

        let gas_sponsored = match warpcast_fid {
            Some(fid) => self
                .warpcast
                .is_primary_address(fid, wallet_address)
                .await
                .map_err(|e| {
                    warn!("Warpcast lookup for FID {} failed: {}", fid, e);
                    invalid_fid()
                })?,
            None => false,
        };

        let session = self
            .create(NewSession {
                watched_address: wallet_address,
                destination_address,
                transfer_mode,
                tracked_tokens,
                gas_sponsored,
                warpcast_fid,
            })
            .await?;

        Ok(StartedSession {
            session_id: session.id,
            is_gas_sponsored: session.gas_sponsored,
        })
    }

    /// Stop the wallet's most recent session, deleting its data with `revoke`
    pub async fn stop(&self, request: StopWatchingRequest) -> SweeperResult<StopOutcome> {
        let Some(wallet) = blank(&request.wallet_address) else {
            return Err(SweeperError::Validation("walletAddress required".to_string()));
        };
        let wallet = parse_address(wallet).ok_or_else(|| {
            SweeperError::Validation("Invalid Ethereum address provided".to_string())
        })?;

        let session = self
            .store
            .latest_session_for_wallet(wallet)
            .await?
            .ok_or_else(|| SweeperError::NotFound("No active session found".to_string()))?;

        if request.revoke {
            self.scheduler.stop_watching(session.id, true).await?;
            return Ok(StopOutcome::Revoked);
        }

        self.scheduler.stop_watching(session.id, false).await?;
        self.store.stop_session(session.id).await?;
        Ok(StopOutcome::Stopped)
    }

    /// Append a free-form activity entry
    pub async fn append_log(&self, request: LogEntryRequest) -> SweeperResult<()> {
        let (Some(kind), Some(message)) = (blank(&request.kind), blank(&request.message)) else {
            return Err(SweeperError::Validation(
                "Both type and message are required.".to_string(),
            ));
        };

        let message = if kind.eq_ignore_ascii_case(RecordKind::Log.as_str()) {
            message.to_string()
        } else {
            format!("[{}] {}", kind, message)
        };

        self.store
            .record_transfer(NewTransferRecord {
                kind: Some(RecordKind::Log),
                message: Some(message),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Most recent records first; `limit` is capped at the configured page size
    pub async fn list_transfers(
        &self,
        session_id: Option<Uuid>,
        limit: Option<usize>,
    ) -> SweeperResult<Vec<TransferRecord>> {
        let limit = limit
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);
        self.store
            .list_transfers(TransferFilter { session_id, limit })
            .await
    }

    async fn create(&self, new: NewSession) -> SweeperResult<WatchSession> {
        let session = self.store.create_session(new).await?;
        self.scheduler.start_watching(session.clone());
        info!(
            "Session {} created: {:?} -> {:?} ({})",
            session.id,
            session.watched_address,
            session.destination_address,
            session.transfer_mode.name()
        );
        Ok(session)
    }

    /// Validate both sides concurrently; the first invalid input is reported
    async fn validate_pair(
        &self,
        watched: &str,
        destination: &str,
    ) -> SweeperResult<(Address, Address)> {
        let (w, d) = tokio::join!(
            self.validator.validate(watched),
            self.validator.validate(destination)
        );

        match (w.resolved_address, d.resolved_address) {
            (Some(w_addr), Some(d_addr)) if w.valid && d.valid => {
                if w_addr == d_addr {
                    return Err(SweeperError::Validation(
                        "Watched cannot equal Destination.".to_string(),
                    ));
                }
                Ok((w_addr, d_addr))
            }
            _ => {
                let bad = if w.valid { destination } else { watched };
                Err(SweeperError::Validation(format!("Invalid wallet/ENS: {}", bad)))
            }
        }
    }
}

fn invalid_fid() -> SweeperError {
    SweeperError::Validation("Invalid Warpcast FID.".to_string())
}

fn parse_fid(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|fid| *fid > 0)
}

fn parse_tokens(value: Option<&Value>) -> SweeperResult<Vec<Address>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(SweeperError::Validation(
                "tokenAddresses must be an array".to_string(),
            ))
        }
    };

    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| parse_address(s.trim()))
                .ok_or_else(|| {
                    SweeperError::Validation(format!("Invalid token address: {}", item))
                })
        })
        .collect()
}

fn parse_amount(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => U256::from_dec_str(s.trim()).ok(),
        _ => None,
    }
}

/// Absent mode means minimum-balance when a minimum is given, zero-out
/// otherwise
fn parse_mode(mode: Option<&str>, minimum: Option<&Value>) -> SweeperResult<TransferMode> {
    let minimum = minimum
        .filter(|v| !v.is_null())
        .map(|v| {
            parse_amount(v).ok_or_else(|| {
                SweeperError::Validation(
                    "minimumBalance must be a non-negative integer amount".to_string(),
                )
            })
        })
        .transpose()?;

    let mode = mode.map(str::trim).filter(|m| !m.is_empty());
    match (mode, minimum) {
        (None, None) => Ok(TransferMode::ZeroOut),
        (None, Some(minimum)) => Ok(TransferMode::MinimumBalance { minimum }),
        (Some("zero_out" | "zeroOut"), _) => Ok(TransferMode::ZeroOut),
        (Some("minimum_balance" | "minimumBalance"), Some(minimum)) => {
            Ok(TransferMode::MinimumBalance { minimum })
        }
        (Some("minimum_balance" | "minimumBalance"), None) => Err(SweeperError::Validation(
            "minimumBalance is required for minimum_balance mode".to_string(),
        )),
        (Some(other), _) => Err(SweeperError::Validation(format!(
            "Unknown transferMode: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validator::{MockChainEndpoint, MockNameResolver};
    use crate::chain::{ChainEndpoint, MockChainDataProvider};
    use crate::config::WatcherConfig;
    use crate::state::{MemorySessionStore, SessionStatus};
    use crate::tx::MockTransferExecutor;
    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    const WATCHED: &str = "0x1111111111111111111111111111111111111111";
    const DEST: &str = "0x2222222222222222222222222222222222222222";

    struct Harness {
        store: Arc<MemorySessionStore>,
        scheduler: Arc<WatchScheduler>,
        service: WatchService,
    }

    fn validator(all_valid: bool) -> Arc<ChainValidator> {
        let mut resolver = MockNameResolver::new();
        resolver
            .expect_resolve()
            .returning(|name| Ok((name == "alice.eth").then(|| Address::repeat_byte(0x33))));

        let mut endpoint = MockChainEndpoint::new();
        endpoint.expect_label().returning(|| "mock".to_string());
        endpoint
            .expect_has_activity()
            .returning(move |_| Ok(all_valid));

        let endpoints: Vec<Arc<dyn ChainEndpoint>> = vec![Arc::new(endpoint)];
        Arc::new(ChainValidator::new(
            Arc::new(resolver),
            endpoints,
            vec![".eth".to_string()],
            Duration::from_secs(1),
        ))
    }

    fn harness_with(all_valid: bool, warpcast_url: &str) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let scheduler = Arc::new(WatchScheduler::new(
            store.clone(),
            Arc::new(MockChainDataProvider::new()),
            Arc::new(MockTransferExecutor::new()),
            &WatcherConfig {
                poll_interval_ms: 600_000,
                poll_timeout_ms: 1_000,
                data_rpc_url: "http://localhost".to_string(),
                max_transfers_per_poll: 100,
                max_page_size: 100,
                shutdown_grace_ms: 1_000,
            },
        ));
        let service = WatchService::new(
            validator(all_valid),
            store.clone(),
            scheduler.clone(),
            WarpcastClient::new(warpcast_url).unwrap(),
            3,
        );
        Harness {
            store,
            scheduler,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(true, "http://127.0.0.1:9")
    }

    fn start_request(body: Value) -> StartWatchingRequest {
        serde_json::from_value(body).unwrap()
    }

    fn validation_message(result: SweeperResult<impl std::fmt::Debug>) -> String {
        match result {
            Err(SweeperError::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_rejects_equal_fields() {
        let h = harness();
        let message = validation_message(
            h.service
                .watch(WatchRequest {
                    watched: Some("0xA".to_string()),
                    destination: Some("0xA".to_string()),
                })
                .await,
        );
        assert_eq!(message, "Watched cannot equal Destination.");
    }

    #[tokio::test]
    async fn test_watch_rejects_blank_fields() {
        let h = harness();
        let message = validation_message(
            h.service
                .watch(WatchRequest {
                    watched: Some("  ".to_string()),
                    destination: Some(DEST.to_string()),
                })
                .await,
        );
        assert_eq!(message, "Fields cannot be blank.");
    }

    #[tokio::test]
    async fn test_watch_resolves_names_and_conflicts_on_repeat() {
        let h = harness();
        let request = || WatchRequest {
            watched: Some("alice.eth".to_string()),
            destination: Some(DEST.to_string()),
        };

        let started = h.service.watch(request()).await.unwrap();
        assert_eq!(started.watched, display_address(&Address::repeat_byte(0x33)));
        assert!(h.scheduler.is_watching(started.session_id));

        match h.service.watch(request()).await {
            Err(SweeperError::Conflict(message)) => assert_eq!(message, "Config already exists."),
            other => panic!("expected conflict, got {:?}", other),
        }
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_reports_invalid_side() {
        let h = harness_with(false, "http://127.0.0.1:9");
        let message = validation_message(
            h.service
                .watch(WatchRequest {
                    watched: Some(WATCHED.to_string()),
                    destination: Some(DEST.to_string()),
                })
                .await,
        );
        assert_eq!(message, format!("Invalid wallet/ENS: {}", WATCHED));
        assert!(h.store.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_with_minimum_balance() {
        let h = harness();
        let started = h
            .service
            .start(start_request(json!({
                "walletAddress": WATCHED,
                "destinationAddress": DEST,
                "transferMode": "minimum_balance",
                "minimumBalance": "100",
                "tokenAddresses": ["0x3333333333333333333333333333333333333333"]
            })))
            .await
            .unwrap();
        assert!(!started.is_gas_sponsored);

        let session = h.store.get_session(started.session_id).await.unwrap().unwrap();
        assert_eq!(
            session.transfer_mode,
            TransferMode::MinimumBalance {
                minimum: U256::from(100)
            }
        );
        assert_eq!(session.tracked_tokens, vec![Address::repeat_byte(0x33)]);
        assert!(h.scheduler.is_watching(session.id));
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_bad_input() {
        let h = harness();
        let cases = [
            (json!({ "walletAddress": WATCHED }), "walletAddress and destinationAddress are required"),
            (json!({ "walletAddress": "alice.eth", "destinationAddress": DEST }), "Invalid Ethereum address provided"),
            (
                json!({ "walletAddress": WATCHED, "destinationAddress": DEST, "tokenAddresses": "0x33" }),
                "tokenAddresses must be an array",
            ),
            (
                json!({ "walletAddress": WATCHED, "destinationAddress": DEST, "transferMode": "minimum_balance" }),
                "minimumBalance is required for minimum_balance mode",
            ),
            (
                json!({ "walletAddress": WATCHED, "destinationAddress": DEST, "warpcastFid": "abc" }),
                "Invalid Warpcast FID.",
            ),
        ];

        for (body, expected) in cases {
            assert_eq!(validation_message(h.service.start(start_request(body)).await), expected);
        }
        assert!(h.store.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_sponsored_when_fid_matches() {
        let app = Router::new().route(
            "/fc/primary-address",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let address = if q.get("fid").map(String::as_str) == Some("3") {
                    WATCHED
                } else {
                    DEST
                };
                Json(json!({ "result": { "address": { "address": address } } }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let h = harness_with(true, &url);
        let sponsored = h
            .service
            .start(start_request(json!({
                "walletAddress": WATCHED,
                "destinationAddress": DEST,
                "warpcastFid": 3
            })))
            .await
            .unwrap();
        assert!(sponsored.is_gas_sponsored);

        let other = harness_with(true, &url);
        let unsponsored = other
            .service
            .start(start_request(json!({
                "walletAddress": WATCHED,
                "destinationAddress": DEST,
                "warpcastFid": "4"
            })))
            .await
            .unwrap();
        assert!(!unsponsored.is_gas_sponsored);

        h.scheduler.shutdown().await;
        other.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_warpcast_failure_is_invalid_fid() {
        let h = harness();
        let message = validation_message(
            h.service
                .start(start_request(json!({
                    "walletAddress": WATCHED,
                    "destinationAddress": DEST,
                    "warpcastFid": 3
                })))
                .await,
        );
        assert_eq!(message, "Invalid Warpcast FID.");
    }

    #[tokio::test]
    async fn test_stop_and_revoke() {
        let h = harness();
        let request = || {
            start_request(json!({ "walletAddress": WATCHED, "destinationAddress": DEST }))
        };
        let stop = |revoke| StopWatchingRequest {
            wallet_address: Some(WATCHED.to_string()),
            revoke,
        };

        let first = h.service.start(request()).await.unwrap();
        assert_eq!(h.service.stop(stop(false)).await.unwrap(), StopOutcome::Stopped);
        assert!(!h.scheduler.is_watching(first.session_id));
        let stored = h.store.get_session(first.session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);

        // Stopped sessions no longer block a new one
        let second = h.service.start(request()).await.unwrap();
        assert_eq!(h.service.stop(stop(true)).await.unwrap(), StopOutcome::Revoked);
        assert!(h.store.get_session(second.session_id).await.unwrap().is_none());

        match h.service.stop(stop(false)).await {
            Err(SweeperError::NotFound(message)) => assert_eq!(message, "No active session found"),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unwatch_is_idempotent() {
        let h = harness();
        let session = h
            .service
            .start(start_request(json!({ "walletAddress": WATCHED, "destinationAddress": DEST })))
            .await
            .unwrap();

        let request = || UnwatchRequest {
            watched: Some(WATCHED.to_string()),
        };
        assert_eq!(h.service.unwatch(request()).await.unwrap(), 1);
        assert_eq!(h.service.unwatch(request()).await.unwrap(), 0);
        assert!(!h.scheduler.is_watching(session.session_id));
        assert!(h.store.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_entries_and_page_cap() {
        let h = harness();
        assert_eq!(
            validation_message(
                h.service
                    .append_log(LogEntryRequest {
                        kind: Some("log".to_string()),
                        message: None,
                    })
                    .await
            ),
            "Both type and message are required."
        );

        for i in 0..5 {
            h.service
                .append_log(LogEntryRequest {
                    kind: Some("log".to_string()),
                    message: Some(format!("entry {}", i)),
                })
                .await
                .unwrap();
        }

        let page = h.service.list_transfers(None, Some(50)).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].kind, RecordKind::Log);
        assert_eq!(h.service.list_transfers(None, Some(2)).await.unwrap().len(), 2);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(None, None).unwrap(), TransferMode::ZeroOut);
        assert_eq!(
            parse_mode(None, Some(&json!(150))).unwrap(),
            TransferMode::MinimumBalance {
                minimum: U256::from(150)
            }
        );
        assert_eq!(
            parse_mode(Some("zeroOut"), Some(&json!("5"))).unwrap(),
            TransferMode::ZeroOut
        );
        assert!(parse_mode(Some("half"), None).is_err());
        assert!(parse_mode(None, Some(&json!("-1"))).is_err());
        assert!(parse_mode(None, Some(&json!(1.5))).is_err());
    }

    #[test]
    fn test_parse_fid() {
        assert_eq!(parse_fid(&json!(3)), Some(3));
        assert_eq!(parse_fid(&json!(" 42 ")), Some(42));
        assert_eq!(parse_fid(&json!(0)), None);
        assert_eq!(parse_fid(&json!(true)), None);
    }
}
