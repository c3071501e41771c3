// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive priority queue.
//!
//! Buffers outgoing payloads across operator-defined classes with a strict
//! total capacity. Dequeue order is weighted round robin: a class with
//! weight `w` gets `w` consecutive picks before the scheduler rotates, and
//! empty classes are skipped without accumulating credit. When free space
//! falls under five percent the queue stops taking items and hands them to
//! the spill sink instead.

use crate::config::QueueConfig;
use crate::error::RelayError;
use crate::metrics::QueueMetrics;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spill side-channel. Bound to the durable store's `append` in production.
pub type SpillSink = Box<dyn Fn(&[u8]) -> std::io::Result<()> + Send + Sync>;

/// Free-ratio floor below which enqueue diverts to the spill sink.
const SPILL_FREE_RATIO: f64 = 0.05;

/// Result of an enqueue attempt.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The item was admitted to its class queue.
    Enqueued,
    /// The item went to the spill sink.
    Spilled,
    /// The queue is under pressure and no sink took the item; ownership
    /// returns to the caller, who may retry or drop.
    Rejected(Vec<u8>),
}

struct ClassRuntime {
    name: String,
    weight: u32,
    pattern: Regex,
}

struct QueueItem {
    payload: Vec<u8>,
    #[allow(dead_code)]
    enqueued_at: Instant,
}

struct QueueState {
    queues: Vec<VecDeque<QueueItem>>,
    total: usize,
    current_class: usize,
    tokens_left: u32,
}

/// Class-partitioned queue with weighted round-robin dequeue and overflow
/// spill. All mutation happens under one short exclusive section.
pub struct AdaptivePriorityQueue {
    classes: Vec<ClassRuntime>,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    spill_sink: Mutex<Option<SpillSink>>,
    metrics: Arc<QueueMetrics>,
}

impl AdaptivePriorityQueue {
    pub fn new(config: &QueueConfig, metrics: Arc<QueueMetrics>) -> Result<Self, RelayError> {
        if config.capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if config.classes.is_empty() {
            return Err(RelayError::InvalidConfig(
                "queue needs at least one class".to_string(),
            ));
        }
        let mut classes = Vec::with_capacity(config.classes.len());
        for class in &config.classes {
            if class.weight == 0 {
                return Err(RelayError::InvalidConfig(format!(
                    "class '{}' must have weight >= 1",
                    class.name
                )));
            }
            let pattern = Regex::new(&class.pattern).map_err(|e| {
                RelayError::InvalidConfig(format!("class '{}' pattern: {e}", class.name))
            })?;
            classes.push(ClassRuntime {
                name: class.name.clone(),
                weight: class.weight,
                pattern,
            });
        }

        let first_weight = classes[0].weight;
        let queues = classes.iter().map(|_| VecDeque::new()).collect();
        Ok(Self {
            classes,
            capacity: config.capacity,
            state: Mutex::new(QueueState {
                queues,
                total: 0,
                current_class: 0,
                tokens_left: first_weight,
            }),
            notify: Notify::new(),
            spill_sink: Mutex::new(None),
            metrics,
        })
    }

    /// Bind the overflow side-channel. Replaces any previous sink.
    pub fn set_spill_sink(&self, sink: SpillSink) {
        let mut guard = self.spill_sink.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(sink);
    }

    /// Index of the first class whose pattern matches `projection`, or the
    /// last class when none does.
    pub fn classify(&self, projection: &str) -> usize {
        self.classes
            .iter()
            .position(|class| class.pattern.is_match(projection))
            .unwrap_or(self.classes.len() - 1)
    }

    /// Admit `payload` under the class selected by `projection`, or divert
    /// it to the spill sink when free space is below the floor.
    pub fn enqueue(&self, payload: Vec<u8>, projection: &str) -> EnqueueOutcome {
        let class = self.classify(projection);

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let free = self.capacity - state.total;
            let free_ratio = free as f64 / self.capacity as f64;
            if free_ratio >= SPILL_FREE_RATIO {
                state.queues[class].push_back(QueueItem {
                    payload,
                    enqueued_at: Instant::now(),
                });
                state.total += 1;
                self.publish_gauges(&state);
                drop(state);
                self.notify.notify_one();
                return EnqueueOutcome::Enqueued;
            }
        }

        // Queue pressure. The sink runs outside the queue lock because it
        // usually means disk I/O.
        let sink = self.spill_sink.lock().unwrap_or_else(|e| e.into_inner());
        match sink.as_ref() {
            None => EnqueueOutcome::Rejected(payload),
            Some(sink) => match sink(&payload) {
                Ok(()) => {
                    self.metrics.spill_total.inc(&self.classes[class].name);
                    debug!(class = %self.classes[class].name, "queue full, payload spilled");
                    EnqueueOutcome::Spilled
                }
                Err(e) => {
                    debug!(class = %self.classes[class].name, error = %e, "spill sink failed");
                    EnqueueOutcome::Rejected(payload)
                }
            },
        }
    }

    /// Pop the next payload per the weighted round-robin discipline, or
    /// `None` immediately if every class is empty.
    pub fn try_dequeue(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.total == 0 {
            return None;
        }
        loop {
            let current = state.current_class;
            if state.tokens_left > 0 && !state.queues[current].is_empty() {
                let item = state.queues[current].pop_front()?;
                state.total -= 1;
                state.tokens_left -= 1;
                self.publish_gauges(&state);
                return Some(item.payload);
            }
            // Rotate to the next non-empty class; a fresh token grant, no
            // carried-over credit.
            let class_count = self.classes.len();
            for step in 1..=class_count {
                let candidate = (current + step) % class_count;
                if !state.queues[candidate].is_empty() {
                    state.current_class = candidate;
                    state.tokens_left = self.classes[candidate].weight;
                    break;
                }
            }
        }
    }

    /// Wait for a payload, observing `cancel` at every wait point. Returns
    /// `None` promptly once cancelled, with no state change, even when
    /// items remain queued.
    pub async fn dequeue_blocking(&self, cancel: &CancellationToken) -> Option<Vec<u8>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(payload) = self.try_dequeue() {
                return Some(payload);
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = self.notify.notified() => {}
            }
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    pub fn per_class_size(&self, class: usize) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queues.get(class).map(VecDeque::len).unwrap_or(0)
    }

    pub fn class_name(&self, class: usize) -> Option<&str> {
        self.classes.get(class).map(|c| c.name.as_str())
    }

    fn publish_gauges(&self, state: &QueueState) {
        self.metrics
            .fill_ratio
            .set(state.total as f64 / self.capacity as f64);
        for (class, queue) in self.classes.iter().zip(&state.queues) {
            self.metrics.class_size.set(&class.name, queue.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(capacity: usize, classes: Vec<(&str, u32, &str)>) -> AdaptivePriorityQueue {
        let config = QueueConfig {
            capacity,
            classes: classes
                .into_iter()
                .map(|(name, weight, pattern)| ClassConfig {
                    name: name.to_string(),
                    weight,
                    pattern: pattern.to_string(),
                })
                .collect(),
        };
        AdaptivePriorityQueue::new(&config, Arc::new(QueueMetrics::default()))
            .expect("queue construction failed")
    }

    #[test]
    fn weighted_fairness_sequence() {
        // Classes [A w=3, B w=1], ten items each, first eight dequeues.
        let q = queue(100, vec![("a", 3, "^a$"), ("b", 1, "^b$")]);
        for i in 0..10 {
            assert!(matches!(
                q.enqueue(format!("a{i}").into_bytes(), "a"),
                EnqueueOutcome::Enqueued
            ));
            assert!(matches!(
                q.enqueue(format!("b{i}").into_bytes(), "b"),
                EnqueueOutcome::Enqueued
            ));
        }
        let labels: Vec<u8> = (0..8)
            .map(|_| q.try_dequeue().expect("queue should not be empty")[0])
            .collect();
        assert_eq!(labels, b"aaabaaab".to_vec());
    }

    #[test]
    fn fairness_fraction_over_weight_window() {
        let q = queue(200, vec![("a", 3, "^a$"), ("b", 2, "^b$"), ("c", 1, "^c$")]);
        for _ in 0..30 {
            q.enqueue(b"a".to_vec(), "a");
            q.enqueue(b"b".to_vec(), "b");
            q.enqueue(b"c".to_vec(), "c");
        }
        // With sustained backlog, any window of sum-of-weights consecutive
        // dequeues carries exactly weight[i] items of class i.
        for _ in 0..10 {
            let window: Vec<u8> = (0..6)
                .map(|_| q.try_dequeue().expect("backlog should remain")[0])
                .collect();
            assert_eq!(window.iter().filter(|&&b| b == b'a').count(), 3);
            assert_eq!(window.iter().filter(|&&b| b == b'b').count(), 2);
            assert_eq!(window.iter().filter(|&&b| b == b'c').count(), 1);
        }
    }

    #[test]
    fn empty_classes_are_skipped_without_credit() {
        let q = queue(100, vec![("a", 3, "^a$"), ("b", 1, "^b$")]);
        for _ in 0..4 {
            q.enqueue(b"b".to_vec(), "b");
        }
        // Only b has backlog: every pick is b, no waiting for a's tokens.
        for _ in 0..4 {
            assert_eq!(q.try_dequeue().expect("item expected")[0], b'b');
        }
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn fifo_within_class() {
        let q = queue(100, vec![("only", 1, ".*")]);
        for i in 0..5u8 {
            q.enqueue(vec![i], "x");
        }
        for i in 0..5u8 {
            assert_eq!(q.try_dequeue().expect("item expected"), vec![i]);
        }
    }

    #[test]
    fn unmatched_projection_lands_in_last_class() {
        let q = queue(
            100,
            vec![("critical", 5, r"^system\."), ("normal", 1, r"^app\.")],
        );
        assert_eq!(q.classify("system.cpu"), 0);
        assert_eq!(q.classify("app.requests"), 1);
        assert_eq!(q.classify("totally.unrelated"), 1);
    }

    #[test]
    fn spill_on_overflow_invokes_sink_exactly_once() {
        // Capacity 20, one class. The 21st enqueue must spill.
        let metrics = Arc::new(QueueMetrics::default());
        let q = AdaptivePriorityQueue::new(
            &QueueConfig {
                capacity: 20,
                classes: vec![ClassConfig {
                    name: "normal".to_string(),
                    weight: 1,
                    pattern: ".*".to_string(),
                }],
            },
            Arc::clone(&metrics),
        )
        .expect("queue construction failed");
        let spilled = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&spilled);
        q.set_spill_sink(Box::new(move |payload| {
            sink_log.lock().expect("sink log lock").push(payload.to_vec());
            Ok(())
        }));

        for i in 0..20 {
            assert!(
                matches!(
                    q.enqueue(format!("p{i}").into_bytes(), "x"),
                    EnqueueOutcome::Enqueued
                ),
                "item {i} should be admitted"
            );
        }
        assert!(matches!(
            q.enqueue(b"p20".to_vec(), "x"),
            EnqueueOutcome::Spilled
        ));

        let spilled = spilled.lock().expect("sink log lock");
        assert_eq!(spilled.as_slice(), &[b"p20".to_vec()]);
        assert_eq!(metrics.spill_total.get("normal"), 1);
        assert_eq!(q.size(), 20);
    }

    #[test]
    fn enqueue_at_five_percent_free_is_admitted() {
        // Capacity 100: at 95 items free ratio is exactly 0.05, which is
        // not strictly below the floor, so the enqueue is admitted. The
        // next one sees 0.04 and spills.
        let q = queue(100, vec![("normal", 1, ".*")]);
        let spills = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spills);
        q.set_spill_sink(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        for i in 0..96 {
            assert!(
                matches!(q.enqueue(vec![0], "x"), EnqueueOutcome::Enqueued),
                "item {i} should be admitted"
            );
        }
        assert_eq!(q.size(), 96);
        assert!(matches!(q.enqueue(vec![0], "x"), EnqueueOutcome::Spilled));
        assert_eq!(spills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let q = queue(20, vec![("normal", 1, ".*")]);
        q.set_spill_sink(Box::new(|_| Ok(())));
        for _ in 0..100 {
            q.enqueue(vec![0], "x");
            assert!(q.size() <= 20);
        }
        assert_eq!(q.size(), 20);
        assert_eq!(q.per_class_size(0), 20);
    }

    #[test]
    fn overflow_without_sink_rejects_and_returns_payload() {
        let q = queue(1, vec![("normal", 1, ".*")]);
        // Capacity 1: the queue is immediately at zero free after one item,
        // and even the first enqueue sees free ratio 1.0 so it is admitted.
        assert!(matches!(q.enqueue(b"one".to_vec(), "x"), EnqueueOutcome::Enqueued));
        match q.enqueue(b"two".to_vec(), "x") {
            EnqueueOutcome::Rejected(payload) => assert_eq!(payload, b"two".to_vec()),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn sink_error_rejects_and_returns_payload() {
        let q = queue(1, vec![("normal", 1, ".*")]);
        q.set_spill_sink(Box::new(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }));
        q.enqueue(b"one".to_vec(), "x");
        match q.enqueue(b"two".to_vec(), "x") {
            EnqueueOutcome::Rejected(payload) => assert_eq!(payload, b"two".to_vec()),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn payload_bytes_survive_the_queue_unchanged() {
        let q = queue(10, vec![("normal", 1, ".*")]);
        let payload: Vec<u8> = (0..=255).collect();
        q.enqueue(payload.clone(), "x");
        assert_eq!(q.try_dequeue().expect("item expected"), payload);
    }

    #[tokio::test]
    async fn dequeue_blocking_returns_promptly_on_cancel() {
        let q = Arc::new(queue(10, vec![("normal", 1, ".*")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.dequeue_blocking(&cancel).await.is_none());
        assert_eq!(q.size(), 0);
    }

    #[tokio::test]
    async fn dequeue_blocking_wakes_on_enqueue() {
        let q = Arc::new(queue(10, vec![("normal", 1, ".*")]));
        let cancel = CancellationToken::new();

        let waiter = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.dequeue_blocking(&cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.enqueue(b"wake".to_vec(), "x");

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("dequeue should wake")
            .expect("task should not panic");
        assert_eq!(got, Some(b"wake".to_vec()));
    }
}
