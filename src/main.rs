//! Wallet Sweeper - sweep-on-deposit watcher
//!
//! Watches wallets on a fixed interval and forwards any balance above the
//! configured minimum to a destination address. Mutating requests are
//! idempotent and users can export-then-erase all of their data.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod farcaster;
mod idempotency;
mod metrics;
mod revoke;
mod state;
mod tx;
mod watch;

use chain::{AlchemyDataProvider, ChainEndpoint, ChainValidator, RpcEndpoint};
use config::{Settings, StorageBackend};
use farcaster::{DirectCastClient, WarpcastClient};
use idempotency::{IdempotencyGuard, IdempotencyStore, MemoryIdempotencyStore, PgIdempotencyStore};
use metrics::MetricsServer;
use revoke::RevocationService;
use state::{MemorySessionStore, PgSessionStore, SessionStore};
use tx::ContractTransferExecutor;
use watch::{WatchScheduler, WatchService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Wallet Sweeper v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} validation endpoints, poll interval {:?}",
        settings.validation.rpc_urls.len(),
        settings.watcher.poll_interval()
    );

    // Storage backends
    let pg_store = match (settings.storage.backend, settings.idempotency.backend) {
        (StorageBackend::Memory, StorageBackend::Memory) => None,
        _ => {
            let database = settings
                .database
                .as_ref()
                .context("[database] is required for the postgres backend")?;
            let store = PgSessionStore::new(database).await?;
            store.run_migrations().await?;
            info!("Database connection established");
            Some(Arc::new(store))
        }
    };

    let store: Arc<dyn SessionStore> = match (settings.storage.backend, &pg_store) {
        (StorageBackend::Postgres, Some(pg)) => pg.clone(),
        _ => {
            warn!("Using in-memory session store; sessions do not survive restarts");
            Arc::new(MemorySessionStore::new())
        }
    };

    let idempotency_store: Arc<dyn IdempotencyStore> =
        match (settings.idempotency.backend, &pg_store) {
            (StorageBackend::Postgres, Some(pg)) => {
                let store = PgIdempotencyStore::new(pg.pool());
                store.run_migrations().await?;
                Arc::new(store)
            }
            _ => Arc::new(MemoryIdempotencyStore::new()),
        };
    let guard = Arc::new(IdempotencyGuard::new(
        idempotency_store,
        &settings.idempotency,
    ));

    // Validation endpoints
    let validation_timeout = settings.validation.timeout();
    let endpoints = settings
        .validation
        .rpc_urls
        .iter()
        .map(|url| {
            RpcEndpoint::new(url, validation_timeout)
                .map(|endpoint| Arc::new(endpoint) as Arc<dyn ChainEndpoint>)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let resolver = Arc::new(RpcEndpoint::new(
        &settings.validation.naming_rpc_url,
        validation_timeout,
    )?);
    let validator = Arc::new(ChainValidator::new(
        resolver,
        endpoints,
        settings.validation.name_suffixes.clone(),
        validation_timeout,
    ));

    // Watcher
    let data_endpoint =
        RpcEndpoint::new(&settings.watcher.data_rpc_url, settings.watcher.poll_timeout())?;
    if !data_endpoint.health_check().await {
        warn!("Transfer data endpoint is not reachable yet; pollers will retry");
    }
    let data_provider = Arc::new(AlchemyDataProvider::new(
        data_endpoint,
        settings.watcher.max_transfers_per_poll,
    ));
    let executor = Arc::new(ContractTransferExecutor::from_config(&settings.executor)?);
    info!("Sweeps signed by {:?}", executor.signer_address());

    let scheduler = Arc::new(WatchScheduler::new(
        store.clone(),
        data_provider,
        executor,
        &settings.watcher,
    ));
    let restored = scheduler.restore().await?;
    info!("{} sessions resumed", restored);

    let watch_service = Arc::new(WatchService::new(
        validator,
        store.clone(),
        scheduler.clone(),
        WarpcastClient::new(&settings.farcaster.warpcast_api_url)?,
        settings.watcher.max_page_size,
    ));
    let revocation = Arc::new(RevocationService::new(
        store.clone(),
        scheduler.clone(),
        DirectCastClient::from_config(&settings.farcaster)?,
        settings.revoke.export_dir.clone(),
    ));

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.server.clone();
        let state = api::AppState {
            watch: watch_service,
            revocation,
            store,
        };
        let guard = guard.clone();
        async move {
            if let Err(e) = api::run_server(config, state, guard).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Expired idempotency keys
    let eviction_handle = tokio::spawn({
        let guard = guard.clone();
        let every = std::time::Duration::from_secs(settings.idempotency.sweep_interval_secs.max(1));
        async move { guard.run_eviction(every).await }
    });

    info!("Wallet Sweeper is running");
    info!(
        "API server: http://{}:{}",
        settings.server.host, settings.server.port
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Stop accepting requests, then drain pollers
    api_handle.abort();
    scheduler.shutdown().await;

    eviction_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Wallet Sweeper stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,wallet_sweeper=debug,sqlx=warn,hyper=warn")
    });

    // SWEEPER_LOG_FORMAT=json for log shippers
    let json = std::env::var("SWEEPER_LOG_FORMAT").map_or(false, |v| v == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
