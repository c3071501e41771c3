// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::config::Scorer;
use relay_core::export::{Exporter, HttpExporter};
use relay_core::pipeline::{Pipeline, SubmitOutcome};
use relay_core::telemetry::MetricBatch;
use relay_core::{RelayConfig, RelayError};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_STARTUP_IO: i32 = 2;

const DEFAULT_INGEST_ADDR: &str = "0.0.0.0:4317";
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:4318/v1/metrics";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("hyper=off,h2=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(match EnvFilter::try_new(env_filter) {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("invalid RELAY_LOG_LEVEL: {e}");
                return EXIT_CONFIG;
            }
        })
        .with_level(true)
        .with_target(true)
        .without_time()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install logging subscriber");
        return EXIT_CONFIG;
    }
    debug!("logging subsystem enabled");

    let config = match config_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return EXIT_CONFIG;
        }
    };

    let upstream_url =
        env::var("RELAY_UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
    let exporter: Arc<dyn Exporter> = match HttpExporter::new(upstream_url.clone(), UPSTREAM_TIMEOUT)
    {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            error!("failed to build upstream client: {e}");
            return EXIT_CONFIG;
        }
    };

    let pipeline = match Pipeline::start(config, exporter) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e @ RelayError::InvalidConfig(_)) => {
            error!("configuration error: {e}");
            return EXIT_CONFIG;
        }
        Err(e) => {
            error!("fatal startup error: {e}");
            return EXIT_STARTUP_IO;
        }
    };
    info!(upstream = %upstream_url, "relay agent started");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let ingest_addr =
        env::var("RELAY_INGEST_ADDR").unwrap_or_else(|_| DEFAULT_INGEST_ADDR.to_string());
    let app = Router::new()
        .route("/v1/metrics", post(ingest_metrics))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(Arc::clone(&pipeline));

    let listener = match tokio::net::TcpListener::bind(&ingest_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %ingest_addr, "failed to bind ingest listener: {e}");
            return EXIT_STARTUP_IO;
        }
    };
    info!(addr = %ingest_addr, "ingest endpoint listening");

    let serve_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await });
    if let Err(e) = server.await {
        error!("ingest server failed: {e}");
    }

    // Ingest has stopped accepting; drain and seal.
    info!("shutting down");
    match pipeline.shutdown().await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("shutdown error: {e}");
            EXIT_STARTUP_IO
        }
    }
}

/// Hand a decoded batch to the pipeline. The relay never pushes back on
/// producers: pressure is absorbed by the queue and the spill store.
async fn ingest_metrics(
    State(pipeline): State<Arc<Pipeline>>,
    Json(batch): Json<MetricBatch>,
) -> (StatusCode, Json<serde_json::Value>) {
    let outcome = pipeline.submit(batch);
    let label = match outcome {
        SubmitOutcome::Enqueued => "enqueued",
        SubmitOutcome::Spilled => "spilled",
        SubmitOutcome::Empty => "empty",
        SubmitOutcome::Dropped => "dropped",
    };
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": label })),
    )
}

/// Environment-driven configuration. `RELAY_SPILL_DIR` is required;
/// everything else falls back to documented defaults.
fn config_from_env() -> Result<RelayConfig, RelayError> {
    let spill_dir = env::var("RELAY_SPILL_DIR")
        .map_err(|_| RelayError::InvalidConfig("RELAY_SPILL_DIR is required".to_string()))?;
    let mut config = RelayConfig::new(spill_dir);

    if let Ok(value) = env::var("RELAY_QUEUE_CAPACITY") {
        config.queue.capacity = value
            .parse()
            .map_err(|_| RelayError::InvalidConfig("RELAY_QUEUE_CAPACITY must be an integer".to_string()))?;
    }
    if let Ok(value) = env::var("RELAY_MAX_KEYS") {
        config.limiter.max_keys = value
            .parse()
            .map_err(|_| RelayError::InvalidConfig("RELAY_MAX_KEYS must be an integer".to_string()))?;
    }
    if let Ok(value) = env::var("RELAY_SCORER") {
        config.limiter.scorer = match value.as_str() {
            "entropy" => Scorer::Entropy,
            "attr-bytes" => Scorer::AttrBytes,
            other => {
                return Err(RelayError::InvalidConfig(format!(
                    "RELAY_SCORER must be 'entropy' or 'attr-bytes', got '{other}'"
                )))
            }
        };
    }
    if let Ok(value) = env::var("RELAY_MAX_SEGMENT_BYTES") {
        config.store.max_segment_bytes = value
            .parse()
            .map_err(|_| RelayError::InvalidConfig("RELAY_MAX_SEGMENT_BYTES must be an integer".to_string()))?;
    }
    if let Ok(value) = env::var("RELAY_REPLAY_RATE_BYTES_PER_SEC") {
        config.store.replay_rate_bytes_per_sec = value.parse().map_err(|_| {
            RelayError::InvalidConfig("RELAY_REPLAY_RATE_BYTES_PER_SEC must be an integer".to_string())
        })?;
    }

    config.validate()?;
    Ok(config)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("failed to listen for ctrl-c");
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => error!("failed to listen for SIGTERM: {e}"),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("ctrl-c received"),
            () = terminate => info!("SIGTERM received"),
        }
        shutdown.cancel();
    });
}
