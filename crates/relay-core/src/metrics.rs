// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constructor-injected metric sinks.
//!
//! Components receive their metric bundle at construction instead of writing
//! to a process-wide registry, so tests can assert counters on an isolated
//! instance. Exporting these values to an operator-facing system is the
//! host's concern and out of scope here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Integer gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Floating-point gauge, stored as IEEE-754 bits.
#[derive(Debug, Default)]
pub struct FloatGauge {
    bits: AtomicU64,
}

impl FloatGauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Labelled counter family, e.g. `dropped_samples_total{metric}`.
#[derive(Debug, Default)]
pub struct CounterVec {
    values: Mutex<HashMap<String, u64>>,
}

impl CounterVec {
    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    pub fn add(&self, label: &str, delta: u64) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        *values.entry(label.to_string()).or_insert(0) += delta;
    }

    pub fn get(&self, label: &str) -> u64 {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(label).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.values().sum()
    }
}

/// Counters and gauges published by the cardinality limiter.
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    pub dropped_samples_total: CounterVec,
    pub aggregated_samples_total: CounterVec,
    pub keys_used: Gauge,
    pub evictions_total: CounterVec,
}

/// Labelled gauge family, e.g. `apq_class_size{class}`.
#[derive(Debug, Default)]
pub struct GaugeVec {
    values: Mutex<HashMap<String, u64>>,
}

impl GaugeVec {
    pub fn set(&self, label: &str, value: u64) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(label.to_string(), value);
    }

    pub fn get(&self, label: &str) -> u64 {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(label).copied().unwrap_or(0)
    }
}

/// Counters and gauges published by the adaptive priority queue.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub spill_total: CounterVec,
    pub fill_ratio: FloatGauge,
    pub class_size: GaugeVec,
}

/// Counters and gauges published by the spill store.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub size_bytes: Gauge,
    pub oldest_age_seconds: Gauge,
    pub utilization_ratio: FloatGauge,
    pub replay_success_total: Counter,
    pub replay_dropped_total: Counter,
    pub corrupted_total: Counter,
    pub recovered_truncated_total: Counter,
}

/// Counters published by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub sends_total: Counter,
    pub transient_failures_total: Counter,
    pub permanent_failures_total: Counter,
}

/// The full set of metric bundles. Each bundle is individually shareable so
/// a component only holds the sink it writes to.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    pub limiter: Arc<LimiterMetrics>,
    pub queue: Arc<QueueMetrics>,
    pub store: Arc<StoreMetrics>,
    pub dispatch: Arc<DispatchMetrics>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
