// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// An attribute value attached to a data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl AttributeValue {
    /// Canonical string form used for fingerprinting and scoring.
    pub fn as_canonical_string(&self) -> String {
        match self {
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Number(n) => {
                // Integral floats render without the trailing ".0" so that
                // producers sending `5` and `5.0` collapse to one key.
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            AttributeValue::String(s) => s.clone(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Aggregation temporality of a data point. Sum points are additive when
/// coalesced, gauge points keep the latest observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    Gauge,
    Sum,
}

/// A single decoded metric data point as handed over by the ingestion
/// front-end. Attribute keys are unique within a point; order is the
/// producer's and is irrelevant to identity (see [`DataPoint::fingerprint`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub metric: String,
    pub kind: PointKind,
    pub value: f64,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub attributes: Vec<(String, AttributeValue)>,
}

impl DataPoint {
    /// 64-bit FNV-1a fingerprint of the canonicalised attribute set.
    ///
    /// Pairs are hashed in lexicographic key order with values in canonical
    /// string form, so two attribute sets with equal canonicalisation yield
    /// the same fingerprint regardless of producer ordering.
    pub fn fingerprint(&self) -> u64 {
        let mut pairs: Vec<(&str, String)> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_canonical_string()))
            .collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut hasher = FnvHasher::default();
        for (key, value) in pairs {
            hasher.write(key.as_bytes());
            hasher.write(&[0xff]);
            hasher.write(value.as_bytes());
            hasher.write(&[0xfe]);
        }
        hasher.finish()
    }
}

/// A batch of data points. This is the unit the limiter processes and, once
/// serialized, the opaque payload the queue and the spill store carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    pub points: Vec<DataPoint>,
}

impl MetricBatch {
    pub fn new(points: Vec<DataPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Projection string used by the queue classifier. For metric payloads
    /// this is the name of the first point in the batch.
    pub fn projection(&self) -> &str {
        self.points.first().map(|p| p.metric.as_str()).unwrap_or("")
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_with(attributes: Vec<(String, AttributeValue)>) -> DataPoint {
        DataPoint {
            metric: "system.cpu.time".to_string(),
            kind: PointKind::Sum,
            value: 1.0,
            timestamp: 1_700_000_000,
            attributes,
        }
    }

    #[test]
    fn fingerprint_ignores_attribute_order() {
        let a = point_with(vec![
            ("host".to_string(), "web-1".into()),
            ("region".to_string(), "eu-west-1".into()),
        ]);
        let b = point_with(vec![
            ("region".to_string(), "eu-west-1".into()),
            ("host".to_string(), "web-1".into()),
        ]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let a = point_with(vec![("host".to_string(), "web-1".into())]);
        let b = point_with(vec![("host".to_string(), "web-2".into())]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_separates_key_value_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = point_with(vec![("ab".to_string(), "c".into())]);
        let b = point_with(vec![("a".to_string(), "bc".into())]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn numeric_values_canonicalise_integral_floats() {
        let a = point_with(vec![("code".to_string(), AttributeValue::Number(5.0))]);
        let b = point_with(vec![("code".to_string(), "5".into())]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn batch_round_trips_through_bytes() {
        let batch = MetricBatch::new(vec![point_with(vec![
            ("host".to_string(), "web-1".into()),
            ("up".to_string(), true.into()),
        ])]);
        let bytes = batch.to_bytes().expect("serialize failed");
        let decoded = MetricBatch::from_bytes(&bytes).expect("deserialize failed");
        assert_eq!(batch, decoded);
    }

    #[test]
    fn projection_is_first_metric_name() {
        let batch = MetricBatch::new(vec![point_with(vec![])]);
        assert_eq!(batch.projection(), "system.cpu.time");
        assert_eq!(MetricBatch::default().projection(), "");
    }
}
