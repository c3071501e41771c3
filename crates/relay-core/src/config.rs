// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Scoring strategy used by the cardinality limiter.
///
/// `Entropy` is the shipped default; `AttrBytes` is the documented
/// lighter-weight fallback. The active scorer is logged at startup so
/// operators know which behaviour they are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scorer {
    Entropy,
    AttrBytes,
}

/// Eviction policy for the limiter's key table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    HeatLru,
    Random,
}

/// Cardinality limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub max_keys: usize,
    pub high_score: f64,
    pub critical_score: f64,
    pub aggregate_labels: Vec<String>,
    pub eviction_policy: EvictionPolicy,
    pub scorer: Scorer,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_keys: 65_536,
            high_score: 0.75,
            critical_score: 0.90,
            aggregate_labels: vec!["container.image.tag".to_string(), "k8s.pod.uid".to_string()],
            eviction_policy: EvictionPolicy::HeatLru,
            scorer: Scorer::Entropy,
        }
    }
}

/// One priority class: items whose projection matches `pattern` are queued
/// under this class. Config order is the tie-break order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    pub weight: u32,
    pub pattern: String,
}

/// Adaptive priority queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub classes: Vec<ClassConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 2_000,
            classes: vec![
                ClassConfig {
                    name: "critical".to_string(),
                    weight: 5,
                    pattern: r"^system\.".to_string(),
                },
                ClassConfig {
                    name: "high".to_string(),
                    weight: 3,
                    pattern: "severity>=30".to_string(),
                },
                ClassConfig {
                    name: "normal".to_string(),
                    weight: 1,
                    pattern: ".*".to_string(),
                },
            ],
        }
    }
}

/// Durable spill store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub directory: PathBuf,
    pub max_segment_bytes: u64,
    pub max_total_bytes: u64,
    #[serde(with = "duration_secs")]
    pub verification_interval: Duration,
    pub replay_rate_bytes_per_sec: u64,
    #[serde(with = "duration_secs")]
    pub replay_retry_base: Duration,
    #[serde(with = "duration_secs")]
    pub replay_retry_cap: Duration,
}

impl StoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_segment_bytes: 128 * 1024 * 1024,
            max_total_bytes: 15 * 1024 * 1024 * 1024,
            verification_interval: Duration::from_secs(600),
            replay_rate_bytes_per_sec: 4 * 1024 * 1024,
            replay_retry_base: Duration::from_secs(1),
            replay_retry_cap: Duration::from_secs(30),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub send_concurrency: usize,
    #[serde(with = "duration_secs")]
    pub drain_deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_concurrency: 4,
            drain_deadline: Duration::from_secs(10),
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub limiter: LimiterConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
}

impl RelayConfig {
    pub fn new(spill_directory: impl Into<PathBuf>) -> Self {
        Self {
            limiter: LimiterConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::new(spill_directory),
            dispatch: DispatchConfig::default(),
        }
    }

    /// Validate operator-supplied values. Failures here abort startup.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.limiter.max_keys == 0 {
            return Err(RelayError::InvalidConfig(
                "limiter.max_keys must be positive".to_string(),
            ));
        }
        // Thresholds above 1.0 are allowed on purpose: a critical_score of
        // 1.0 or more disables drops, a high_score above 1.0 disables
        // aggregation. Only negative or non-finite values are nonsense.
        for (name, score) in [
            ("limiter.high_score", self.limiter.high_score),
            ("limiter.critical_score", self.limiter.critical_score),
        ] {
            if !score.is_finite() || score < 0.0 {
                return Err(RelayError::InvalidConfig(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }

        if self.queue.capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if self.queue.classes.is_empty() {
            return Err(RelayError::InvalidConfig(
                "queue.classes must not be empty".to_string(),
            ));
        }
        for class in &self.queue.classes {
            if class.weight == 0 {
                return Err(RelayError::InvalidConfig(format!(
                    "queue class '{}' must have weight >= 1",
                    class.name
                )));
            }
            if let Err(e) = regex::Regex::new(&class.pattern) {
                return Err(RelayError::InvalidConfig(format!(
                    "queue class '{}' has an invalid pattern: {e}",
                    class.name
                )));
            }
        }

        if self.store.directory.as_os_str().is_empty() {
            return Err(RelayError::InvalidConfig(
                "store.directory is required".to_string(),
            ));
        }
        if self.store.max_segment_bytes == 0 || self.store.max_total_bytes == 0 {
            return Err(RelayError::InvalidConfig(
                "store segment and total sizes must be positive".to_string(),
            ));
        }
        if self.store.replay_rate_bytes_per_sec == 0 {
            return Err(RelayError::InvalidConfig(
                "store.replay_rate_bytes_per_sec must be positive".to_string(),
            ));
        }
        if self.store.replay_retry_base > self.store.replay_retry_cap {
            return Err(RelayError::InvalidConfig(
                "store.replay_retry_base must not exceed store.replay_retry_cap".to_string(),
            ));
        }

        if self.dispatch.send_concurrency == 0 {
            return Err(RelayError::InvalidConfig(
                "dispatch.send_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig::new("/tmp/relay-dlq")
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut cfg = config();
        cfg.queue.capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_weight_rejected() {
        let mut cfg = config();
        cfg.queue.classes[0].weight = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut cfg = config();
        cfg.queue.classes[0].pattern = "(".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_negative_score_rejected() {
        let mut cfg = config();
        cfg.limiter.critical_score = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_scores_above_one_allowed() {
        // high_score above 1.0 disables aggregation, critical_score at or
        // above 1.0 disables drops. Both are documented operator choices.
        let mut cfg = config();
        cfg.limiter.high_score = 2.0;
        cfg.limiter.critical_score = 0.5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_directory_rejected() {
        let mut cfg = config();
        cfg.store.directory = PathBuf::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_base_above_cap_rejected() {
        let mut cfg = config();
        cfg.store.replay_retry_base = Duration::from_secs(60);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg = config();
        let json = serde_json::to_string(&cfg).expect("serialize failed");
        let decoded: RelayConfig = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(decoded.queue.capacity, cfg.queue.capacity);
        assert_eq!(decoded.store.verification_interval, cfg.store.verification_interval);
    }
}
