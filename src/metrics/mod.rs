//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Active pollers and poll tick outcomes
//! - Incoming transfers and sweeps
//! - Validation outcomes
//! - Idempotency replays and revocations

use crate::error::SweeperResult;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Watcher metrics
    pub static ref ACTIVE_POLLERS: Gauge = register_gauge!(
        "sweeper_active_pollers",
        "Number of running session pollers"
    ).unwrap();

    pub static ref POLL_TICKS: CounterVec = register_counter_vec!(
        "sweeper_poll_ticks_total",
        "Poll ticks by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref POLL_LATENCY: HistogramVec = register_histogram_vec!(
        "sweeper_poll_latency_seconds",
        "Poll tick duration",
        &["outcome"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref TRANSFERS_RECORDED: CounterVec = register_counter_vec!(
        "sweeper_incoming_transfers_total",
        "Incoming transfers recorded by asset kind",
        &["asset"]
    ).unwrap();

    // Sweep metrics
    pub static ref SWEEPS_SUBMITTED: CounterVec = register_counter_vec!(
        "sweeper_sweeps_submitted_total",
        "Sweeps confirmed on chain",
        &["mode"]
    ).unwrap();

    pub static ref SWEEPS_FAILED: CounterVec = register_counter_vec!(
        "sweeper_sweeps_failed_total",
        "Sweeps that failed",
        &["mode"]
    ).unwrap();

    // Request metrics
    pub static ref VALIDATIONS: CounterVec = register_counter_vec!(
        "sweeper_validations_total",
        "Wallet validations by result",
        &["result"]
    ).unwrap();

    pub static ref IDEMPOTENCY_REPLAYS: CounterVec = register_counter_vec!(
        "sweeper_idempotency_replays_total",
        "Requests answered from the idempotency cache",
        &[]
    ).unwrap();

    pub static ref REVOCATIONS: CounterVec = register_counter_vec!(
        "sweeper_revocations_total",
        "Revocations by delivery channel and outcome",
        &["channel", "outcome"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SweeperResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|e| {
        error!("Metrics output is not UTF-8: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

// Helper functions to record metrics

pub fn record_poller_started() {
    ACTIVE_POLLERS.inc();
}

pub fn record_poller_stopped() {
    ACTIVE_POLLERS.dec();
}

pub fn record_poll_tick(ok: bool, latency_secs: f64) {
    let outcome = if ok { "ok" } else { "failed" };
    POLL_TICKS.with_label_values(&[outcome]).inc();
    POLL_LATENCY.with_label_values(&[outcome]).observe(latency_secs);
}

pub fn record_incoming_transfer(native: bool) {
    TRANSFERS_RECORDED
        .with_label_values(&[if native { "native" } else { "erc20" }])
        .inc();
}

pub fn record_sweep(mode: &str, ok: bool) {
    if ok {
        SWEEPS_SUBMITTED.with_label_values(&[mode]).inc();
    } else {
        SWEEPS_FAILED.with_label_values(&[mode]).inc();
    }
}

pub fn record_validation(valid: bool) {
    VALIDATIONS
        .with_label_values(&[if valid { "valid" } else { "invalid" }])
        .inc();
}

pub fn record_idempotency_replay() {
    IDEMPOTENCY_REPLAYS.with_label_values(&[]).inc();
}

pub fn record_revocation(channel: &str, ok: bool) {
    REVOCATIONS
        .with_label_values(&[channel, if ok { "ok" } else { "failed" }])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_exposes_sweeper_metrics() {
        record_sweep("zero_out", true);
        record_validation(false);

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("sweeper_sweeps_submitted_total"));
        assert!(body.contains("sweeper_validations_total"));
    }
}
