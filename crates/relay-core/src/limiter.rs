// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cardinality limiter.
//!
//! A streaming admission stage that bounds the unique attribute-set
//! population seen by the rest of the pipeline. Every data point gets a
//! cardinality-risk score in [0, 1]; high-risk points lose their
//! configured aggregation labels, critical-risk points are dropped. The
//! limiter never fails a batch: over-limit conditions show up as counter
//! increments, not errors.

use crate::config::{EvictionPolicy, LimiterConfig, Scorer};
use crate::metrics::LimiterMetrics;
use crate::telemetry::{DataPoint, MetricBatch, PointKind};
use fnv::FnvHasher;
use rand::Rng;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Values sampled per attribute key by the entropy scorer.
const RESERVOIR_CAPACITY: usize = 1024;

/// Upper bound on distinct attribute keys the entropy scorer tracks. Keys
/// beyond the bound score zero entropy rather than growing state.
const MAX_TRACKED_ATTRIBUTE_KEYS: usize = 4096;

/// Candidates sampled per heat-weighted eviction.
const EVICTION_SAMPLE: usize = 8;

/// Scores live in the half-open interval [0, 1): a critical threshold of
/// 1.0 therefore admits every point, per the configuration contract.
const MAX_SCORE: f64 = 1.0 - f64::EPSILON;

/// Fixed-size sample of the values observed under one attribute key.
/// Overflow uses random replacement, keeping the sample representative of
/// the whole stream rather than its most recent suffix.
struct ValueReservoir {
    samples: Vec<u64>,
}

impl ValueReservoir {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    fn observe(&mut self, value_hash: u64) {
        if self.samples.len() < RESERVOIR_CAPACITY {
            self.samples.push(value_hash);
        } else {
            let slot = rand::thread_rng().gen_range(0..RESERVOIR_CAPACITY);
            self.samples[slot] = value_hash;
        }
    }

    /// Shannon entropy of the sample histogram, normalised to [0, 1] by the
    /// maximum entropy of a sample this size.
    fn normalized_entropy(&self) -> f64 {
        let n = self.samples.len();
        if n <= 1 {
            return 0.0;
        }
        let mut histogram: HashMap<u64, u32> = HashMap::new();
        for sample in &self.samples {
            *histogram.entry(*sample).or_insert(0) += 1;
        }
        let n = n as f64;
        let entropy: f64 = histogram
            .values()
            .map(|count| {
                let p = f64::from(*count) / n;
                -p * p.log2()
            })
            .sum();
        (entropy / n.log2()).clamp(0.0, 1.0)
    }
}

enum ScoreEngine {
    /// Per-key value reservoirs; the point score combines per-key
    /// normalised entropies as 1 - prod(1 - h_k), which is monotone
    /// non-decreasing in attribute count.
    Entropy {
        reservoirs: HashMap<String, ValueReservoir>,
    },
    /// Byte-count heuristic matching the original MVP scorer:
    /// clamp(total_attribute_bytes / (100 + 5 * attribute_count), 0, 1).
    AttrBytes,
}

impl ScoreEngine {
    fn new(scorer: Scorer) -> Self {
        match scorer {
            Scorer::Entropy => ScoreEngine::Entropy {
                reservoirs: HashMap::new(),
            },
            Scorer::AttrBytes => ScoreEngine::AttrBytes,
        }
    }

    fn score(&mut self, point: &DataPoint) -> f64 {
        if point.attributes.is_empty() {
            return 0.0;
        }
        match self {
            ScoreEngine::Entropy { reservoirs } => {
                let mut keep_probability = 1.0;
                for (key, value) in &point.attributes {
                    let mut hasher = FnvHasher::default();
                    hasher.write(value.as_canonical_string().as_bytes());
                    let value_hash = hasher.finish();

                    let tracked = reservoirs.len() < MAX_TRACKED_ATTRIBUTE_KEYS
                        || reservoirs.contains_key(key);
                    if !tracked {
                        continue;
                    }
                    let reservoir = reservoirs
                        .entry(key.clone())
                        .or_insert_with(ValueReservoir::new);
                    reservoir.observe(value_hash);
                    keep_probability *= 1.0 - reservoir.normalized_entropy();
                }
                (1.0 - keep_probability).clamp(0.0, MAX_SCORE)
            }
            ScoreEngine::AttrBytes => {
                let count = point.attributes.len();
                let bytes: usize = point
                    .attributes
                    .iter()
                    .map(|(k, v)| k.len() + v.as_canonical_string().len())
                    .sum();
                (bytes as f64 / (100.0 + 5.0 * count as f64)).clamp(0.0, MAX_SCORE)
            }
        }
    }
}

struct KeyEntry {
    hits: u64,
    last_seen: Instant,
    slot: usize,
}

/// Fingerprint table bounded by `max_keys`. A parallel slot vector gives
/// O(1) uniform sampling for the eviction policies.
struct KeyTable {
    entries: HashMap<u64, KeyEntry>,
    slots: Vec<u64>,
    max_keys: usize,
    policy: EvictionPolicy,
}

impl KeyTable {
    fn new(max_keys: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::with_capacity(max_keys.min(65_536)),
            slots: Vec::with_capacity(max_keys.min(65_536)),
            max_keys,
            policy,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record one sighting of `fingerprint`. Returns true when an existing
    /// entry had to be evicted to make room.
    fn touch(&mut self, fingerprint: u64, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.hits += 1;
            entry.last_seen = now;
            return false;
        }

        let mut evicted = false;
        if self.entries.len() >= self.max_keys {
            let victim = self.pick_victim(now);
            self.remove(victim);
            evicted = true;
        }

        let slot = self.slots.len();
        self.slots.push(fingerprint);
        self.entries.insert(
            fingerprint,
            KeyEntry {
                hits: 1,
                last_seen: now,
                slot,
            },
        );
        evicted
    }

    fn pick_victim(&self, now: Instant) -> u64 {
        let mut rng = rand::thread_rng();
        match self.policy {
            EvictionPolicy::Random => self.slots[rng.gen_range(0..self.slots.len())],
            EvictionPolicy::HeatLru => {
                let mut victim = self.slots[rng.gen_range(0..self.slots.len())];
                let mut coldest = f64::INFINITY;
                for _ in 0..EVICTION_SAMPLE.min(self.slots.len()) {
                    let candidate = self.slots[rng.gen_range(0..self.slots.len())];
                    let entry = &self.entries[&candidate];
                    let idle = now
                        .saturating_duration_since(entry.last_seen)
                        .as_secs_f64()
                        .max(1.0);
                    let heat = entry.hits as f64 / idle;
                    if heat < coldest {
                        coldest = heat;
                        victim = candidate;
                    }
                }
                victim
            }
        }
    }

    fn remove(&mut self, fingerprint: u64) {
        if let Some(entry) = self.entries.remove(&fingerprint) {
            let last = self.slots.len() - 1;
            self.slots.swap(entry.slot, last);
            self.slots.pop();
            if entry.slot < self.slots.len() {
                let moved = self.slots[entry.slot];
                if let Some(moved_entry) = self.entries.get_mut(&moved) {
                    moved_entry.slot = entry.slot;
                }
            }
        }
    }
}

/// Streaming cardinality limiter. One instance owns its key table; callers
/// that share an instance across threads must wrap it in an exclusive
/// section around `process`.
pub struct CardinalityLimiter {
    config: LimiterConfig,
    engine: ScoreEngine,
    table: KeyTable,
    metrics: Arc<LimiterMetrics>,
}

impl CardinalityLimiter {
    pub fn new(config: LimiterConfig, metrics: Arc<LimiterMetrics>) -> Self {
        debug!(
            scorer = ?config.scorer,
            eviction = ?config.eviction_policy,
            max_keys = config.max_keys,
            "cardinality limiter ready"
        );
        Self {
            engine: ScoreEngine::new(config.scorer),
            table: KeyTable::new(config.max_keys, config.eviction_policy),
            config,
            metrics,
        }
    }

    /// Number of fingerprints currently tracked. Never exceeds `max_keys`.
    pub fn keys_used(&self) -> usize {
        self.table.len()
    }

    /// Score, act on, and admit the batch in place. The returned batch is
    /// the same size or smaller; this never fails.
    pub fn process(&mut self, batch: &mut MetricBatch) {
        let now = Instant::now();
        let eviction_label = match self.config.eviction_policy {
            EvictionPolicy::HeatLru => "heat-lru",
            EvictionPolicy::Random => "random",
        };

        // (point, was_aggregated, post-action fingerprint)
        let mut admitted: Vec<(DataPoint, bool, u64)> = Vec::with_capacity(batch.points.len());

        for mut point in batch.points.drain(..) {
            let score = self.engine.score(&point);

            if score >= self.config.critical_score {
                self.metrics.dropped_samples_total.inc(&point.metric);
                debug!(metric = %point.metric, score, "dropping high-cardinality point");
                continue;
            }

            let mut aggregated = false;
            if score >= self.config.high_score {
                point
                    .attributes
                    .retain(|(key, _)| !self.config.aggregate_labels.contains(key));
                self.metrics.aggregated_samples_total.inc(&point.metric);
                aggregated = true;
            }

            let fingerprint = point.fingerprint();
            if self.table.touch(fingerprint, now) {
                self.metrics.evictions_total.inc(eviction_label);
            }
            admitted.push((point, aggregated, fingerprint));
        }

        batch.points = coalesce(admitted);
        self.metrics.keys_used.set(self.table.len() as u64);
    }
}

/// Merge aggregated points that became attribute-identical within the
/// batch: Sum points add their values, Gauge points keep the observation
/// with the latest timestamp. Points the limiter did not touch pass
/// through unchanged.
fn coalesce(admitted: Vec<(DataPoint, bool, u64)>) -> Vec<DataPoint> {
    let mut out: Vec<DataPoint> = Vec::with_capacity(admitted.len());
    let mut merged: HashMap<(String, PointKind, u64), usize> = HashMap::new();

    for (point, aggregated, fingerprint) in admitted {
        if !aggregated {
            out.push(point);
            continue;
        }
        let id = (point.metric.clone(), point.kind, fingerprint);
        match merged.get(&id) {
            Some(&index) => {
                let existing = &mut out[index];
                match point.kind {
                    PointKind::Sum => {
                        existing.value += point.value;
                        existing.timestamp = existing.timestamp.max(point.timestamp);
                    }
                    PointKind::Gauge => {
                        if point.timestamp >= existing.timestamp {
                            existing.value = point.value;
                            existing.timestamp = point.timestamp;
                        }
                    }
                }
            }
            None => {
                merged.insert(id, out.len());
                out.push(point);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::AttributeValue;

    fn limiter(config: LimiterConfig) -> (CardinalityLimiter, Arc<LimiterMetrics>) {
        let metrics = Arc::new(LimiterMetrics::default());
        (CardinalityLimiter::new(config, Arc::clone(&metrics)), metrics)
    }

    fn point(metric: &str, attributes: Vec<(&str, AttributeValue)>) -> DataPoint {
        DataPoint {
            metric: metric.to_string(),
            kind: PointKind::Sum,
            value: 1.0,
            timestamp: 1_700_000_000,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn fallback_scorer_admits_small_points_and_drops_wide_ones() {
        // Scenario: max_keys 2, high 2.0 (aggregation off), critical 0.5.
        let config = LimiterConfig {
            max_keys: 2,
            high_score: 2.0,
            critical_score: 0.5,
            scorer: Scorer::AttrBytes,
            ..LimiterConfig::default()
        };
        let (mut limiter, metrics) = limiter(config);

        let mut batch = MetricBatch::new(vec![
            point("m", vec![("a", "1".into())]),
            point("m", vec![("a", "1".into()), ("b", "2".into())]),
            point(
                "m",
                vec![
                    ("a", "1".into()),
                    ("b", "2".into()),
                    ("c", "3".into()),
                    ("d", "4".into()),
                    ("e", "5".into()),
                ],
            ),
        ]);
        limiter.process(&mut batch);
        assert_eq!(batch.len(), 3, "low scores must all be admitted");
        assert_eq!(metrics.dropped_samples_total.total(), 0);

        let keys_before = metrics.keys_used.get();

        // Ten attributes with 20-byte values scores ~1.0 and is dropped.
        let wide: Vec<(&str, AttributeValue)> = vec![
            ("k0", "aaaaaaaaaaaaaaaaaaaa".into()),
            ("k1", "bbbbbbbbbbbbbbbbbbbb".into()),
            ("k2", "cccccccccccccccccccc".into()),
            ("k3", "dddddddddddddddddddd".into()),
            ("k4", "eeeeeeeeeeeeeeeeeeee".into()),
            ("k5", "ffffffffffffffffffff".into()),
            ("k6", "gggggggggggggggggggg".into()),
            ("k7", "hhhhhhhhhhhhhhhhhhhh".into()),
            ("k8", "iiiiiiiiiiiiiiiiiiii".into()),
            ("k9", "jjjjjjjjjjjjjjjjjjjj".into()),
        ];
        let mut batch = MetricBatch::new(vec![point("m", wide)]);
        limiter.process(&mut batch);

        assert!(batch.is_empty(), "critical-score point must be dropped");
        assert_eq!(metrics.dropped_samples_total.get("m"), 1);
        assert_eq!(metrics.keys_used.get(), keys_before, "drops must not touch the key table");
    }

    #[test]
    fn fallback_score_is_monotone_in_attribute_count() {
        let mut engine = ScoreEngine::new(Scorer::AttrBytes);
        let mut previous = 0.0;
        for n in 1..20 {
            let attributes = (0..n)
                .map(|i| (format!("key{i:02}"), AttributeValue::from("val")))
                .collect();
            let p = DataPoint {
                metric: "m".to_string(),
                kind: PointKind::Gauge,
                value: 0.0,
                timestamp: 0,
                attributes,
            };
            let score = engine.score(&p);
            assert!(score >= previous, "score regressed at {n} attributes");
            previous = score;
        }
    }

    #[test]
    fn key_table_never_exceeds_max_keys() {
        let config = LimiterConfig {
            max_keys: 8,
            scorer: Scorer::AttrBytes,
            ..LimiterConfig::default()
        };
        let (mut limiter, metrics) = limiter(config);

        for i in 0..100 {
            let mut batch = MetricBatch::new(vec![point(
                "m",
                vec![("instance", AttributeValue::String(format!("host-{i}")))],
            )]);
            limiter.process(&mut batch);
            assert!(limiter.keys_used() <= 8);
        }
        assert_eq!(limiter.keys_used(), 8);
        assert_eq!(metrics.keys_used.get(), 8);
        assert_eq!(metrics.evictions_total.get("heat-lru"), 92);
    }

    #[test]
    fn random_eviction_is_counted_separately() {
        let config = LimiterConfig {
            max_keys: 4,
            eviction_policy: EvictionPolicy::Random,
            scorer: Scorer::AttrBytes,
            ..LimiterConfig::default()
        };
        let (mut limiter, metrics) = limiter(config);
        for i in 0..10 {
            let mut batch = MetricBatch::new(vec![point(
                "m",
                vec![("instance", AttributeValue::String(format!("host-{i}")))],
            )]);
            limiter.process(&mut batch);
        }
        assert_eq!(metrics.evictions_total.get("random"), 6);
        assert_eq!(metrics.evictions_total.get("heat-lru"), 0);
    }

    #[test]
    fn hot_keys_survive_heat_weighted_eviction() {
        let config = LimiterConfig {
            max_keys: 4,
            scorer: Scorer::AttrBytes,
            ..LimiterConfig::default()
        };
        let (mut limiter, _metrics) = limiter(config);

        // Make one key very hot.
        for _ in 0..50 {
            let mut batch = MetricBatch::new(vec![point("m", vec![("host", "hot".into())])]);
            limiter.process(&mut batch);
        }
        // Churn through cold keys to force evictions.
        for i in 0..40 {
            let mut batch = MetricBatch::new(vec![point(
                "m",
                vec![("host", AttributeValue::String(format!("cold-{i}")))],
            )]);
            limiter.process(&mut batch);
        }
        // The hot key still hits (no new entry is created for it).
        let before = limiter.keys_used();
        let mut batch = MetricBatch::new(vec![point("m", vec![("host", "hot".into())])]);
        limiter.process(&mut batch);
        assert_eq!(limiter.keys_used(), before, "hot key should still be resident");
    }

    #[test]
    fn aggregation_strips_labels_and_coalesces_sums() {
        let config = LimiterConfig {
            max_keys: 64,
            high_score: 0.0,
            critical_score: 10.0,
            aggregate_labels: vec!["k8s.pod.uid".to_string()],
            scorer: Scorer::AttrBytes,
            ..LimiterConfig::default()
        };
        let (mut limiter, metrics) = limiter(config);

        let mut batch = MetricBatch::new(vec![
            DataPoint {
                timestamp: 10,
                value: 2.0,
                ..point("m", vec![("svc", "api".into()), ("k8s.pod.uid", "a".into())])
            },
            DataPoint {
                timestamp: 20,
                value: 3.0,
                ..point("m", vec![("svc", "api".into()), ("k8s.pod.uid", "b".into())])
            },
        ]);
        limiter.process(&mut batch);

        assert_eq!(batch.len(), 1, "label-stripped twins must coalesce");
        let merged = &batch.points[0];
        assert_eq!(merged.value, 5.0);
        assert_eq!(merged.timestamp, 20);
        assert!(merged.attributes.iter().all(|(k, _)| k != "k8s.pod.uid"));
        assert_eq!(metrics.aggregated_samples_total.get("m"), 2);
    }

    #[test]
    fn gauge_coalescing_keeps_latest_observation() {
        let config = LimiterConfig {
            max_keys: 64,
            high_score: 0.0,
            critical_score: 10.0,
            aggregate_labels: vec!["pod".to_string()],
            scorer: Scorer::AttrBytes,
            ..LimiterConfig::default()
        };
        let (mut limiter, _metrics) = limiter(config);

        let gauge = |ts, value, pod: &str| DataPoint {
            kind: PointKind::Gauge,
            timestamp: ts,
            value,
            ..point("mem.used", vec![("pod", pod.into())])
        };
        let mut batch = MetricBatch::new(vec![gauge(30, 7.0, "a"), gauge(10, 3.0, "b")]);
        limiter.process(&mut batch);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.points[0].value, 7.0, "older gauge must not win");
        assert_eq!(batch.points[0].timestamp, 30);
    }

    #[test]
    fn critical_score_of_one_never_drops_with_entropy_scorer() {
        let config = LimiterConfig {
            max_keys: 128,
            critical_score: 1.0,
            high_score: 1.0,
            ..LimiterConfig::default()
        };
        let (mut limiter, metrics) = limiter(config);
        for i in 0..200 {
            let mut batch = MetricBatch::new(vec![point(
                "m",
                vec![("request.id", AttributeValue::String(format!("id-{i}")))],
            )]);
            limiter.process(&mut batch);
            assert_eq!(batch.len(), 1, "score < 1.0 strictly, so nothing drops");
        }
        assert_eq!(metrics.dropped_samples_total.total(), 0);
    }

    #[test]
    fn entropy_score_rises_with_value_spread() {
        let mut engine = ScoreEngine::new(Scorer::Entropy);

        // A key that always carries the same value stays at zero entropy.
        for _ in 0..100 {
            let score = engine.score(&point("m", vec![("env", "prod".into())]));
            assert_eq!(score, 0.0);
        }

        // A key with a fresh value every time climbs well above zero.
        let mut last = 0.0;
        for i in 0..100 {
            last = engine.score(&point(
                "m",
                vec![("request.id", AttributeValue::String(format!("id-{i}")))],
            ));
        }
        assert!(last > 0.5, "unique-valued key should score high, got {last}");
    }
}
