// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable spill and replay store.
//!
//! Overflow from the in-memory queue lands here as strictly ordered,
//! integrity-sealed, append-only segment files. Once the upstream is
//! healthy again the segments are replayed at a bounded rate and deleted.
//! Segments that fail their integrity check move to `quarantine/` and are
//! never deleted automatically.

mod replay;
mod segment;

pub use segment::{
    segment_file_name, RecoverOutcome, SegmentError, SegmentHeader, SegmentReader, SegmentWriter,
    HEADER_LEN, MAGIC, SEGMENT_SUFFIX,
};

use crate::config::StoreConfig;
use crate::error::RelayError;
use crate::export::Exporter;
use crate::metrics::StoreMetrics;
use chrono::{TimeZone, Utc};
use replay::ReplaySession;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const QUARANTINE_DIR: &str = "quarantine";

struct ActiveState {
    writer: Option<SegmentWriter>,
    /// Unix second of the newest segment name handed out. Rotations within
    /// the same second bump past it so lexicographic order stays strict.
    last_name_ts: i64,
}

struct ReplayControl {
    running: Arc<AtomicBool>,
    cancel: Option<CancellationToken>,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    active: Mutex<ActiveState>,
    replay: Mutex<ReplayControl>,
}

/// Handle to the on-disk store. Cheap to clone; all clones share one
/// active segment and one replay session slot.
#[derive(Clone)]
pub struct SpillStore {
    inner: Arc<StoreInner>,
}

impl SpillStore {
    /// Open (or create) the store directory, reseal crash survivors, and
    /// verify every sealed segment.
    pub fn open(config: StoreConfig, metrics: Arc<StoreMetrics>) -> Result<Self, RelayError> {
        std::fs::create_dir_all(&config.directory).map_err(RelayError::StoreStartup)?;
        std::fs::create_dir_all(config.directory.join(QUARANTINE_DIR))
            .map_err(RelayError::StoreStartup)?;

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                metrics,
                active: Mutex::new(ActiveState {
                    writer: None,
                    last_name_ts: 0,
                }),
                replay: Mutex::new(ReplayControl {
                    running: Arc::new(AtomicBool::new(false)),
                    cancel: None,
                }),
            }),
        };

        store.inner.recover_unsealed()?;
        store.verify_all();
        store.inner.refresh_gauges();
        Ok(store)
    }

    /// Durably buffer one payload into the active segment, rotating when
    /// the segment reaches its size bound. Blocks on disk I/O.
    pub fn append(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());

        if active.writer.is_none() {
            let writer = self.inner.create_segment(&mut active)?;
            active.writer = Some(writer);
        }
        // The writer is present from here on.
        let full = {
            let writer = active.writer.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "active segment missing")
            })?;
            writer.append(payload)?;
            writer.bytes() >= self.inner.config.max_segment_bytes
        };
        if full {
            if let Some(writer) = active.writer.take() {
                let path = writer.seal()?;
                debug!(segment = %path.display(), "segment sealed at size bound");
            }
        }
        drop(active);

        self.inner.refresh_gauges();
        Ok(())
    }

    /// Seal the active segment, if any. Called on graceful shutdown; an
    /// empty active segment is removed instead of sealed.
    pub fn seal_active(&self) -> std::io::Result<()> {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = active.writer.take() {
            if writer.records() == 0 {
                writer.discard()?;
            } else {
                let path = writer.seal()?;
                debug!(segment = %path.display(), "active segment sealed on shutdown");
            }
        }
        drop(active);
        self.inner.refresh_gauges();
        Ok(())
    }

    /// Sealed segments in replay (append) order. The active segment is
    /// excluded.
    pub fn sealed_segments(&self) -> Vec<PathBuf> {
        self.inner.sealed_segments()
    }

    /// Seal the active segment early so its records become replayable
    /// before the size bound is reached. Returns true when a segment was
    /// sealed. Used by the dispatcher once the upstream is healthy again;
    /// spilled data would otherwise sit unreplayable until rotation.
    pub fn rotate_for_replay(&self) -> std::io::Result<bool> {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        let has_records = active
            .writer
            .as_ref()
            .is_some_and(|writer| writer.records() > 0);
        if !has_records {
            return Ok(false);
        }
        if let Some(writer) = active.writer.take() {
            let path = writer.seal()?;
            debug!(segment = %path.display(), "active segment sealed for replay");
        }
        drop(active);
        self.inner.refresh_gauges();
        Ok(true)
    }

    /// Begin a replay session over the currently sealed segments, driving
    /// each record through `exporter`. Returns `ReplayBusy` when a session
    /// is already running and returns promptly when there is nothing to
    /// replay.
    pub fn start_replay(
        &self,
        cancel: &CancellationToken,
        exporter: Arc<dyn Exporter>,
    ) -> Result<(), RelayError> {
        let mut control = self.inner.replay.lock().unwrap_or_else(|e| e.into_inner());
        if control.running.load(Ordering::SeqCst) {
            return Err(RelayError::ReplayBusy);
        }

        let segments = self.inner.sealed_segments();
        if segments.is_empty() {
            return Ok(());
        }

        let session_cancel = cancel.child_token();
        control.running.store(true, Ordering::SeqCst);
        control.cancel = Some(session_cancel.clone());

        let session = ReplaySession::new(
            Arc::clone(&self.inner),
            segments,
            exporter,
            session_cancel,
            Arc::clone(&control.running),
        );
        tokio::spawn(session.run());
        Ok(())
    }

    /// Cancel an ongoing replay session, if any.
    pub fn stop_replay(&self) {
        let control = self.inner.replay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cancel) = &control.cancel {
            cancel.cancel();
        }
    }

    pub fn replay_active(&self) -> bool {
        let control = self.inner.replay.lock().unwrap_or_else(|e| e.into_inner());
        control.running.load(Ordering::SeqCst)
    }

    /// Run the integrity check over every sealed segment, quarantining
    /// failures. Returns the number of segments quarantined.
    pub fn verify_all(&self) -> usize {
        let mut quarantined = 0;
        for path in self.inner.sealed_segments() {
            match segment::verify(&path) {
                Ok(()) => {}
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "segment failed verification");
                    self.inner.quarantine_segment(&path);
                    quarantined += 1;
                }
            }
        }
        if quarantined > 0 {
            self.inner.refresh_gauges();
        }
        quarantined
    }

    /// Periodic verification driver. Runs until cancelled; the active
    /// segment is never checked.
    pub async fn run_verification_loop(&self, cancel: CancellationToken) {
        let period = self.inner.config.verification_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let quarantined = self.verify_all();
                    if quarantined > 0 {
                        warn!(quarantined, "periodic verification quarantined segments");
                    }
                }
            }
        }
    }
}

impl StoreInner {
    /// Reseal unsealed crash survivors and quarantine unreadable files.
    fn recover_unsealed(&self) -> Result<(), RelayError> {
        for path in self.list_segments().map_err(RelayError::StoreStartup)? {
            let header = match SegmentReader::open(&path) {
                Ok((_, header)) => header,
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "unreadable segment at startup");
                    self.quarantine_segment(&path);
                    continue;
                }
            };
            if header.is_sealed() {
                continue;
            }
            match segment::recover(&path) {
                Ok(RecoverOutcome::Sealed { records, truncated }) => {
                    debug!(segment = %path.display(), records, truncated, "resealed crash survivor");
                    if truncated {
                        self.metrics.recovered_truncated_total.inc();
                    }
                }
                Ok(RecoverOutcome::Removed) => {
                    debug!(segment = %path.display(), "removed empty crash survivor");
                }
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "recovery failed");
                    self.quarantine_segment(&path);
                }
            }
        }
        Ok(())
    }

    fn create_segment(&self, active: &mut ActiveState) -> std::io::Result<SegmentWriter> {
        let mut ts = Utc::now().timestamp().max(active.last_name_ts + 1);
        loop {
            let name = match Utc.timestamp_opt(ts, 0).single() {
                Some(when) => segment_file_name(when),
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "segment timestamp out of range",
                    ))
                }
            };
            let path = self.config.directory.join(name);
            match SegmentWriter::create(path.clone()) {
                Ok(writer) => {
                    active.last_name_ts = ts;
                    debug!(segment = %path.display(), "opened new active segment");
                    return Ok(writer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    ts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn list_segments(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.config.directory)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(SEGMENT_SUFFIX))
            {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    pub(crate) fn sealed_segments(&self) -> Vec<PathBuf> {
        let active_path = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.writer.as_ref().map(|w| w.path().to_path_buf())
        };
        self.list_segments()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| Some(p) != active_path.as_ref())
            .collect()
    }

    pub(crate) fn quarantine_segment(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = self.config.directory.join(QUARANTINE_DIR).join(name);
        match std::fs::rename(path, &target) {
            Ok(()) => {
                self.metrics.corrupted_total.inc();
                warn!(
                    segment = %path.display(),
                    quarantine = %target.display(),
                    "segment moved to quarantine"
                );
            }
            Err(e) => {
                warn!(segment = %path.display(), error = %e, "failed to quarantine segment");
            }
        }
    }

    pub(crate) fn delete_segment(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(segment = %path.display(), error = %e, "failed to delete replayed segment");
        } else {
            debug!(segment = %path.display(), "segment fully replayed and deleted");
        }
        self.refresh_gauges();
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    pub(crate) fn refresh_gauges(&self) {
        let Ok(segments) = self.list_segments() else {
            return;
        };
        let mut total: u64 = 0;
        let mut oldest: Option<SystemTime> = None;
        for path in &segments {
            let Ok(meta) = std::fs::metadata(path) else {
                continue;
            };
            total += meta.len();
            if let Ok(modified) = meta.modified() {
                oldest = Some(match oldest {
                    Some(current) if current <= modified => current,
                    _ => modified,
                });
            }
        }
        self.metrics.size_bytes.set(total);
        self.metrics
            .utilization_ratio
            .set(total as f64 / self.config.max_total_bytes as f64);
        let age = oldest
            .and_then(|t| t.elapsed().ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.metrics.oldest_age_seconds.set(age);
    }
}
