// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a single delivery attempt against the upstream sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The upstream acknowledged the payload.
    Ok,
    /// The upstream is slow, overloaded, or unreachable; the payload is
    /// retryable through the spill-and-replay path.
    Transient,
    /// The upstream rejected the payload outright; retrying cannot help.
    Permanent,
}

/// One send attempt of an opaque payload. Implementations do not retry;
/// retry policy belongs to the dispatcher and the replay worker.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn send(&self, payload: &[u8]) -> SendOutcome;
}

/// HTTP exporter posting payloads to a single upstream endpoint.
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExporter {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    async fn send(&self, payload: &[u8]) -> SendOutcome {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(payload.to_vec())
            .send()
            .await;

        match response {
            Ok(response) => classify_status(response.status()),
            Err(e) => {
                // Connection failures and timeouts are upstream weather,
                // not payload problems.
                debug!(error = %e, "send attempt failed before a response");
                SendOutcome::Transient
            }
        }
    }
}

fn classify_status(status: StatusCode) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Ok;
    }
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        debug!(%status, "transient upstream failure");
        return SendOutcome::Transient;
    }
    warn!(%status, "permanent upstream failure, payload will be dropped");
    SendOutcome::Permanent
}
