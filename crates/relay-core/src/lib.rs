// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Relay Core
//!
//! Reliability stage for a telemetry-collection pipeline, sitting between
//! an ingestion front-end and an unreliable upstream sink. The pipeline is
//! a single forward path with one spill side-channel:
//!
//! ```text
//! ingest -> limiter -> queue -> dispatcher -> exporter
//!                        |  on queue pressure      ^ on upstream health
//!                        v                         |
//!                      durable store  --- paced replay
//! ```
//!
//! The three reliability subsystems:
//! - [`limiter`]: streaming cardinality admission with a bounded key table
//! - [`queue`]: class-partitioned buffer with weighted round-robin dequeue
//!   and overflow spill
//! - [`dlq`]: segmented, integrity-sealed on-disk store with rate-paced
//!   replay
//!
//! [`pipeline::Pipeline`] wires them together; hosts embed it and feed it
//! decoded [`telemetry::MetricBatch`]es.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod export;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod telemetry;

pub use config::RelayConfig;
pub use error::RelayError;
pub use pipeline::{Pipeline, SubmitOutcome};
