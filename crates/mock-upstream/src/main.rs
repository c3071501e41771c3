// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock upstream sink for failure-injection testing.
//!
//! Accepts OTLP-shaped ingest on `/v1/{metrics,logs,traces}` and answers
//! 200, or 503 while outage mode is on, or 429 at the configured failure
//! rate. Control endpoints flip the behaviour at runtime so a test can
//! walk the relay through outage and recovery without restarting anything.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct UpstreamState {
    outage: AtomicBool,
    failure_rate_percent: AtomicI32,
    requests_ok: AtomicU64,
    requests_rejected: AtomicU64,
    requests_unavailable: AtomicU64,
}

#[derive(Deserialize)]
struct OutageRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct FailureRateRequest {
    rate_percent: i32,
}

#[derive(Serialize)]
struct StatusResponse {
    outage_enabled: bool,
    failure_rate_percent: i32,
    requests_ok: u64,
    requests_rejected: u64,
    requests_unavailable: u64,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("MOCK_UPSTREAM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let addr = env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "0.0.0.0:4318".to_string());
    let state = Arc::new(UpstreamState::default());

    let app = Router::new()
        .route("/v1/metrics", post(handle_ingest))
        .route("/v1/logs", post(handle_ingest))
        .route("/v1/traces", post(handle_ingest))
        .route("/control/outage", post(handle_outage))
        .route("/control/failure-rate", post(handle_failure_rate))
        .route("/control/status", get(handle_status))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %addr, "failed to bind: {e}");
            std::process::exit(2);
        }
    };
    info!(addr = %addr, "mock upstream listening");
    if let Err(e) = axum::serve(listener, app).await {
        warn!("server failed: {e}");
        std::process::exit(2);
    }
}

async fn handle_ingest(
    State(state): State<Arc<UpstreamState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.outage.load(Ordering::SeqCst) {
        state.requests_unavailable.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "service unavailable" })),
        );
    }

    let rate = state.failure_rate_percent.load(Ordering::SeqCst);
    if rate > 0 && rand::thread_rng().gen_range(0..100) < rate {
        state.requests_rejected.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "too many requests" })),
        );
    }

    state.requests_ok.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, Json(serde_json::json!({ "status": "success" })))
}

async fn handle_outage(
    State(state): State<Arc<UpstreamState>>,
    Json(request): Json<OutageRequest>,
) -> Json<serde_json::Value> {
    state.outage.store(request.enabled, Ordering::SeqCst);
    info!(enabled = request.enabled, "outage mode set");
    Json(serde_json::json!({ "success": true }))
}

async fn handle_failure_rate(
    State(state): State<Arc<UpstreamState>>,
    Json(request): Json<FailureRateRequest>,
) -> Json<serde_json::Value> {
    let rate = request.rate_percent.clamp(0, 100);
    state.failure_rate_percent.store(rate, Ordering::SeqCst);
    info!(rate, "failure rate set");
    Json(serde_json::json!({ "success": true }))
}

async fn handle_status(State(state): State<Arc<UpstreamState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        outage_enabled: state.outage.load(Ordering::SeqCst),
        failure_rate_percent: state.failure_rate_percent.load(Ordering::SeqCst),
        requests_ok: state.requests_ok.load(Ordering::SeqCst),
        requests_rejected: state.requests_rejected.load(Ordering::SeqCst),
        requests_unavailable: state.requests_unavailable.load(Ordering::SeqCst),
    })
}
