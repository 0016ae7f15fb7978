//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Intent ingestion and outcomes
//! - Per-chain dispatch and confirmation
//! - Store contention
//! - Outstanding worker tasks

use crate::error::{DisperserError, DisperserResult};
use crate::intent::IntentStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_gauge, CounterVec, Encoder, GaugeVec, HistogramVec, IntCounter, IntGauge,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Intent metrics
    pub static ref INTENTS_INGESTED: CounterVec = register_counter_vec!(
        "disperser_intents_ingested_total",
        "Deposit events ingested (created=true for new intents)",
        &["created"]
    ).unwrap();

    pub static ref INTENTS_FINISHED: CounterVec = register_counter_vec!(
        "disperser_intents_finished_total",
        "Intents reaching a terminal status",
        &["status"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "disperser_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref DISPATCH_SUBMITTED: CounterVec = register_counter_vec!(
        "disperser_dispatch_submitted_total",
        "Drip transactions accepted by the node",
        &["chain_id"]
    ).unwrap();

    pub static ref DISPATCH_FAILED: CounterVec = register_counter_vec!(
        "disperser_dispatch_failed_total",
        "Chain legs that ended FAILED",
        &["chain_id", "stage"]
    ).unwrap();

    pub static ref DISPATCH_CONFIRMED: CounterVec = register_counter_vec!(
        "disperser_dispatch_confirmed_total",
        "Drip transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "disperser_confirmation_latency_seconds",
        "Time from broadcast to confirmation",
        &["chain_id"],
        vec![1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    // Store metrics
    pub static ref STORE_CONFLICTS: IntCounter = register_int_counter!(
        "disperser_store_conflicts_total",
        "Optimistic version conflicts while patching intents"
    ).unwrap();

    // Task metrics
    pub static ref OUTSTANDING_TASKS: IntGauge = register_int_gauge!(
        "disperser_outstanding_tasks",
        "Dispatch and confirmation tasks currently running"
    ).unwrap();

    pub static ref WORKER_PANICS: IntCounter = register_int_counter!(
        "disperser_worker_panics_total",
        "Chain workers that panicked"
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

    pub async fn run(&self) -> DisperserResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DisperserError::Internal(format!("Metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DisperserError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered collector
pub fn render() -> DisperserResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| DisperserError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| DisperserError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_ingest(created: bool) {
    INTENTS_INGESTED
        .with_label_values(&[if created { "true" } else { "false" }])
        .inc();
}

pub fn record_intent_finished(status: IntentStatus) {
    INTENTS_FINISHED.with_label_values(&[status.as_str()]).inc();
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_dispatch_submitted(chain_id: u64) {
    DISPATCH_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_dispatch_failed(chain_id: u64, stage: &str) {
    DISPATCH_FAILED
        .with_label_values(&[&chain_id.to_string(), stage])
        .inc();
}

pub fn record_dispatch_confirmed(chain_id: u64, latency_secs: f64) {
    let label = chain_id.to_string();
    DISPATCH_CONFIRMED.with_label_values(&[&label]).inc();
    CONFIRMATION_LATENCY
        .with_label_values(&[&label])
        .observe(latency_secs);
}

pub fn record_store_conflict() {
    STORE_CONFLICTS.inc();
}

pub fn set_outstanding_tasks(count: usize) {
    OUTSTANDING_TASKS.set(count as i64);
}

pub fn record_worker_panic() {
    WORKER_PANICS.inc();
}
