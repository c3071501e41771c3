// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced while building or running the relay pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open spill store: {0}")]
    StoreStartup(#[source] std::io::Error),

    #[error("Replay already in progress")]
    ReplayBusy,

    #[error("Pipeline already started")]
    AlreadyStarted,

    #[error("Pipeline not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
