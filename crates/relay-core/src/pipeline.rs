// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline coordinator.
//!
//! Owns the wiring between the limiter, the queue, the durable store, and
//! the dispatcher, plus the startup and shutdown ordering. Ingest threads
//! call [`Pipeline::submit`]; everything downstream runs on background
//! tasks until [`Pipeline::shutdown`].

use crate::config::{RelayConfig, Scorer};
use crate::dispatch::Dispatcher;
use crate::dlq::SpillStore;
use crate::error::RelayError;
use crate::export::Exporter;
use crate::limiter::CardinalityLimiter;
use crate::metrics::RelayMetrics;
use crate::queue::{AdaptivePriorityQueue, EnqueueOutcome};
use crate::telemetry::MetricBatch;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for live delivery.
    Enqueued,
    /// The queue was under pressure; the batch went to the durable store.
    Spilled,
    /// The limiter dropped every point, nothing left to forward.
    Empty,
    /// Queue pressure with no working spill path; the batch is gone.
    Dropped,
}

/// A running relay pipeline.
pub struct Pipeline {
    config: RelayConfig,
    metrics: RelayMetrics,
    limiter: Mutex<CardinalityLimiter>,
    queue: Arc<AdaptivePriorityQueue>,
    store: SpillStore,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Validate the configuration, open the store, and spawn the
    /// background tasks. Must run inside a tokio runtime.
    pub fn start(config: RelayConfig, exporter: Arc<dyn Exporter>) -> Result<Self, RelayError> {
        config.validate()?;

        let scorer = match config.limiter.scorer {
            Scorer::Entropy => "entropy",
            Scorer::AttrBytes => "attr-bytes",
        };
        info!(scorer, "cardinality scorer active");

        let metrics = RelayMetrics::new();
        let store = SpillStore::open(config.store.clone(), Arc::clone(&metrics.store))?;
        let queue = Arc::new(AdaptivePriorityQueue::new(
            &config.queue,
            Arc::clone(&metrics.queue),
        )?);

        let sink_store = store.clone();
        queue.set_spill_sink(Box::new(move |payload| sink_store.append(payload)));

        let limiter = Mutex::new(CardinalityLimiter::new(
            config.limiter.clone(),
            Arc::clone(&metrics.limiter),
        ));

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            store.clone(),
            exporter,
            config.dispatch.clone(),
            Arc::clone(&metrics.dispatch),
            cancel.clone(),
        );
        let mut tasks = dispatcher.spawn();

        let verification_store = store.clone();
        let verification_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            verification_store
                .run_verification_loop(verification_cancel)
                .await;
        }));

        info!(
            classes = config.queue.classes.len(),
            capacity = config.queue.capacity,
            spill_dir = %config.store.directory.display(),
            "relay pipeline started"
        );
        Ok(Self {
            config,
            metrics,
            limiter,
            queue,
            store,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Run one decoded batch through admission control and hand the
    /// survivors to the queue. Never fails; losses surface as counters and
    /// the returned outcome.
    pub fn submit(&self, mut batch: MetricBatch) -> SubmitOutcome {
        if batch.is_empty() {
            return SubmitOutcome::Empty;
        }
        // Classification keys off the batch as the producer sent it.
        let projection = batch.projection().to_string();

        {
            let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
            limiter.process(&mut batch);
        }
        if batch.is_empty() {
            return SubmitOutcome::Empty;
        }

        let payload = match batch.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize batch, dropping it");
                return SubmitOutcome::Dropped;
            }
        };
        match self.queue.enqueue(payload, &projection) {
            EnqueueOutcome::Enqueued => SubmitOutcome::Enqueued,
            EnqueueOutcome::Spilled => SubmitOutcome::Spilled,
            EnqueueOutcome::Rejected(_) => {
                warn!("queue under pressure and no spill path, batch dropped");
                SubmitOutcome::Dropped
            }
        }
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &SpillStore {
        &self.store
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Graceful shutdown: let the workers drain the queue up to the
    /// configured deadline, stop replay and the workers, spill whatever is
    /// left, and seal the active segment. Idempotent.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        debug!("pipeline shutdown started");

        let deadline = Instant::now() + self.config.dispatch.drain_deadline;
        while self.queue.size() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.cancel.cancel();
        self.store.stop_replay();
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }

        let mut spilled = 0usize;
        while let Some(payload) = self.queue.try_dequeue() {
            match self.store.append(&payload) {
                Ok(()) => spilled += 1,
                Err(e) => warn!(error = %e, "failed to spill during shutdown, payload lost"),
            }
        }
        if spilled > 0 {
            info!(spilled, "undelivered payloads spilled to disk at shutdown");
        }

        self.store.seal_active()?;
        info!("relay pipeline stopped");
        Ok(())
    }
}
