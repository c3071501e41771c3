// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::segment::SegmentReader;
use super::StoreInner;
use crate::export::{Exporter, SendOutcome};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Token bucket replenish period.
const TOKEN_TICK: Duration = Duration::from_millis(10);

/// Live/replay alternation period. During the live half the worker sends
/// nothing, so combined outbound is roughly half live and half replay when
/// both have traffic. Live egress itself never blocks on this worker; the
/// dispatcher drains the queue independently.
const TOGGLE_TICK: Duration = Duration::from_millis(500);

/// Clears the store's replay-running flag when the session ends, whatever
/// the exit path.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A single replay pass over the segments that were sealed when the
/// session started. Older segments drain strictly before newer ones; each
/// segment is deleted only after every record in it was acknowledged.
pub(crate) struct ReplaySession {
    inner: Arc<StoreInner>,
    segments: Vec<PathBuf>,
    exporter: Arc<dyn Exporter>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

enum RecordFate {
    Sent,
    Dropped,
    Cancelled,
}

impl ReplaySession {
    pub(crate) fn new(
        inner: Arc<StoreInner>,
        segments: Vec<PathBuf>,
        exporter: Arc<dyn Exporter>,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner,
            segments,
            exporter,
            cancel,
            running,
        }
    }

    pub(crate) async fn run(self) {
        let _guard = RunningGuard(Arc::clone(&self.running));
        debug!(segments = self.segments.len(), "replay session started");

        let rate = self.inner.config().replay_rate_bytes_per_sec;
        let per_tick = (rate / 100).max(1) as i64;
        let burst_cap = rate as i64;
        let mut tokens: i64 = per_tick;
        let mut live_phase = false;

        let now = tokio::time::Instant::now();
        let mut token_tick = tokio::time::interval_at(now + TOKEN_TICK, TOKEN_TICK);
        let mut toggle_tick = tokio::time::interval_at(now + TOGGLE_TICK, TOGGLE_TICK);

        'segments: for path in &self.segments {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut reader = match SegmentReader::open(path) {
                Ok((reader, _header)) => reader,
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "cannot open segment for replay");
                    self.inner.quarantine_segment(path);
                    continue 'segments;
                }
            };

            loop {
                let record = match reader.next_record() {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        self.inner.delete_segment(path);
                        break;
                    }
                    Err(e) => {
                        // The segment passed its seal check but a record is
                        // unreadable; keep the evidence and move on.
                        warn!(segment = %path.display(), error = %e, "record unreadable during replay");
                        self.inner.quarantine_segment(path);
                        continue 'segments;
                    }
                };

                // Wait for the replay phase and a positive byte budget.
                loop {
                    if !live_phase && tokens > 0 {
                        break;
                    }
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        _ = toggle_tick.tick() => live_phase = !live_phase,
                        _ = token_tick.tick() => tokens = (tokens + per_tick).min(burst_cap),
                    }
                }

                match self.send_record(&record.payload).await {
                    RecordFate::Sent => {
                        tokens -= record.disk_len as i64;
                        self.inner.metrics().replay_success_total.inc();
                    }
                    RecordFate::Dropped => {
                        self.inner.metrics().replay_dropped_total.inc();
                    }
                    RecordFate::Cancelled => return,
                }
            }
        }
        debug!("replay session drained all segments");
    }

    /// Deliver one record, retrying transient failures with exponential
    /// back-off until success or cancellation. Permanent failures drop the
    /// record; retrying a rejected payload cannot succeed.
    async fn send_record(&self, payload: &[u8]) -> RecordFate {
        let base = self.inner.config().replay_retry_base;
        let cap = self.inner.config().replay_retry_cap;
        let mut attempt: u32 = 0;

        loop {
            match self.exporter.send(payload).await {
                SendOutcome::Ok => return RecordFate::Sent,
                SendOutcome::Permanent => {
                    warn!("upstream permanently rejected a replayed record, dropping it");
                    return RecordFate::Dropped;
                }
                SendOutcome::Transient => {
                    let backoff = backoff_with_jitter(base, cap, attempt);
                    attempt = attempt.saturating_add(1);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "replay send failed, backing off");
                    tokio::select! {
                        () = self.cancel.cancelled() => return RecordFate::Cancelled,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

/// base * 2^attempt, capped, with a ±20% jitter so synchronized retries
/// spread out.
fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    capped.mul_f64(jitter)
}
