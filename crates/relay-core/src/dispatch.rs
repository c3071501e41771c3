// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dispatcher: drains the priority queue into the exporter and gates
//! replay on upstream health.
//!
//! Health is judged over a sliding window of the last 32 send outcomes.
//! The upstream counts as healthy while the transient-failure ratio stays
//! under 25% and the window holds no permanent failure. Replay starts when
//! health flips to healthy and stops when it flips away; a periodic check
//! re-arms replay for segments sealed after a session already drained.

use crate::config::DispatchConfig;
use crate::dlq::SpillStore;
use crate::export::{Exporter, SendOutcome};
use crate::metrics::DispatchMetrics;
use crate::queue::AdaptivePriorityQueue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of send outcomes the health judgment looks back over.
const HEALTH_WINDOW: usize = 32;

/// Transient-failure ratio at or above which the upstream is unhealthy.
const UNHEALTHY_TRANSIENT_RATIO: f64 = 0.25;

/// Cadence of the replay re-arm check.
const REPLAY_GATE_PERIOD: Duration = Duration::from_secs(1);

/// Sliding window over recent send outcomes.
pub struct HealthWindow {
    outcomes: VecDeque<SendOutcome>,
}

impl HealthWindow {
    pub fn new() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(HEALTH_WINDOW),
        }
    }

    pub fn record(&mut self, outcome: SendOutcome) {
        if self.outcomes.len() == HEALTH_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
    }

    pub fn is_healthy(&self) -> bool {
        if self.outcomes.is_empty() {
            return true;
        }
        let mut transients = 0usize;
        for outcome in &self.outcomes {
            match outcome {
                SendOutcome::Permanent => return false,
                SendOutcome::Transient => transients += 1,
                SendOutcome::Ok => {}
            }
        }
        (transients as f64 / self.outcomes.len() as f64) < UNHEALTHY_TRANSIENT_RATIO
    }
}

impl Default for HealthWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls payloads from the queue and performs single send attempts,
/// steering failures into the durable store. Clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<AdaptivePriorityQueue>,
    store: SpillStore,
    exporter: Arc<dyn Exporter>,
    config: DispatchConfig,
    metrics: Arc<DispatchMetrics>,
    health: Arc<Mutex<HealthWindow>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<AdaptivePriorityQueue>,
        store: SpillStore,
        exporter: Arc<dyn Exporter>,
        config: DispatchConfig,
        metrics: Arc<DispatchMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            store,
            exporter,
            config,
            metrics,
            health: Arc::new(Mutex::new(HealthWindow::new())),
            cancel,
        }
    }

    /// Spawn the send workers and the replay re-arm task.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.send_concurrency + 1);
        for worker in 0..self.config.send_concurrency {
            let dispatcher = self.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker).await;
            }));
        }
        let dispatcher = self.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.replay_gate_loop().await;
        }));
        handles
    }

    async fn worker_loop(&self, worker: usize) {
        debug!(worker, "send worker started");
        while let Some(payload) = self.queue.dequeue_blocking(&self.cancel).await {
            self.send_once(&payload).await;
        }
        debug!(worker, "send worker stopped");
    }

    /// One delivery attempt. Transient failures divert the payload to the
    /// durable store so nothing is lost while the upstream is sick;
    /// permanent failures drop it.
    pub async fn send_once(&self, payload: &[u8]) {
        let outcome = self.exporter.send(payload).await;
        self.metrics.sends_total.inc();
        match outcome {
            SendOutcome::Ok => {}
            SendOutcome::Transient => {
                self.metrics.transient_failures_total.inc();
                if let Err(e) = self.store.append(payload) {
                    warn!(error = %e, "failed to spill after transient send failure, payload lost");
                }
            }
            SendOutcome::Permanent => {
                self.metrics.permanent_failures_total.inc();
                warn!("upstream permanently rejected payload, dropping it");
            }
        }
        self.observe(outcome);
    }

    /// Record an outcome and act on a health transition.
    fn observe(&self, outcome: SendOutcome) {
        let (was_healthy, now_healthy) = {
            let mut window = self.health.lock().unwrap_or_else(|e| e.into_inner());
            let was = window.is_healthy();
            window.record(outcome);
            (was, window.is_healthy())
        };
        if was_healthy == now_healthy {
            return;
        }
        if now_healthy {
            debug!("upstream recovered, starting replay");
            self.start_replay();
        } else {
            debug!("upstream unhealthy, stopping replay");
            self.store.stop_replay();
        }
    }

    /// While healthy, keep a replay session armed whenever sealed segments
    /// exist. `start_replay` is idempotent-busy so re-arming is safe.
    async fn replay_gate_loop(&self) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + REPLAY_GATE_PERIOD,
            REPLAY_GATE_PERIOD,
        );
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.is_healthy() {
                continue;
            }
            // Make buffered records replayable: anything still sitting in
            // the active segment was spilled during the outage.
            if self.store.sealed_segments().is_empty() {
                if let Err(e) = self.store.rotate_for_replay() {
                    warn!(error = %e, "failed to rotate active segment for replay");
                }
            }
            if !self.store.sealed_segments().is_empty() {
                self.start_replay();
            }
        }
    }

    fn start_replay(&self) {
        use crate::error::RelayError;
        match self
            .store
            .start_replay(&self.cancel, Arc::clone(&self.exporter))
        {
            Ok(()) => {}
            Err(RelayError::ReplayBusy) => {}
            Err(e) => warn!(error = %e, "failed to start replay"),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(ok: usize, transient: usize) -> HealthWindow {
        let mut window = HealthWindow::new();
        for _ in 0..ok {
            window.record(SendOutcome::Ok);
        }
        for _ in 0..transient {
            window.record(SendOutcome::Transient);
        }
        window
    }

    #[test]
    fn empty_window_is_healthy() {
        assert!(HealthWindow::new().is_healthy());
    }

    #[test]
    fn nine_transients_of_thirty_two_is_unhealthy() {
        // 9/32 = 28%, at or above the 25% bar.
        let window = window_with(23, 9);
        assert!(!window.is_healthy());
    }

    #[test]
    fn seven_transients_of_thirty_two_is_healthy() {
        // 7/32 = 22%, under the bar.
        let window = window_with(25, 7);
        assert!(window.is_healthy());
    }

    #[test]
    fn exactly_one_quarter_is_unhealthy() {
        // 8/32 = 25%: the bar is strict, healthy requires strictly less.
        let window = window_with(24, 8);
        assert!(!window.is_healthy());
    }

    #[test]
    fn single_permanent_failure_is_unhealthy() {
        let mut window = window_with(31, 0);
        window.record(SendOutcome::Permanent);
        assert!(!window.is_healthy());
    }

    #[test]
    fn permanent_failure_ages_out_of_the_window() {
        let mut window = HealthWindow::new();
        window.record(SendOutcome::Permanent);
        assert!(!window.is_healthy());
        for _ in 0..32 {
            window.record(SendOutcome::Ok);
        }
        assert!(window.is_healthy());
    }

    #[test]
    fn recovery_transition_at_seven_transients() {
        // Start unhealthy at 9 transients, then push successes until only
        // 7 transients remain in view; the window must read healthy again.
        let mut window = window_with(23, 9);
        assert!(!window.is_healthy());
        window.record(SendOutcome::Ok);
        window.record(SendOutcome::Ok);
        // The two oldest entries that fell out were Ok, so still 9/32.
        assert!(!window.is_healthy());
        for _ in 0..23 {
            window.record(SendOutcome::Ok);
        }
        // 25 successes pushed in total: the 23 initial successes and the
        // two oldest transients have aged out, leaving 7/32.
        assert!(window.is_healthy());
    }
}
