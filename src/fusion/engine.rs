//! Candidate grouping and confidence fusion.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::Utc;

use crate::config::{DetectionConfig, SeverityBands};
use crate::detect::{AnomalyCandidate, DetectorKind};
use crate::fusion::{anomaly_id, Anomaly, AnomalyStatus, Severity};

/// Merges detector candidates into canonical anomalies.
pub struct FusionEngine {
    weight_statistical: f64,
    weight_outlier: f64,
    weight_forecast: f64,
    bands: SeverityBands,
}

impl FusionEngine {
    pub fn new(detection: &DetectionConfig, bands: SeverityBands) -> Self {
        Self {
            weight_statistical: detection.weight_statistical,
            weight_outlier: detection.weight_outlier,
            weight_forecast: detection.weight_forecast,
            bands,
        }
    }

    fn weight(&self, kind: DetectorKind) -> f64 {
        match kind {
            DetectorKind::Statistical => self.weight_statistical,
            DetectorKind::Outlier => self.weight_outlier,
            DetectorKind::Forecast => self.weight_forecast,
        }
    }

    /// Map combined confidence to severity via the configured bands.
    pub fn severity_for(&self, confidence: f64) -> Severity {
        if confidence >= self.bands.high_at {
            Severity::High
        } else if confidence >= self.bands.medium_at {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Group candidates by (entity, metric, day, direction) and fuse each
    /// group. Weighted noisy-OR: `1 - prod(1 - w_i * c_i)` over contributing
    /// detectors, which rises monotonically with every agreeing method.
    pub fn fuse(&self, candidates: Vec<AnomalyCandidate>) -> Vec<Anomaly> {
        let mut groups: BTreeMap<(String, String, String, &'static str), Vec<AnomalyCandidate>> =
            BTreeMap::new();
        for c in candidates {
            let key = (
                c.entity.clone(),
                c.metric.clone(),
                c.day.to_string(),
                c.direction.as_str(),
            );
            groups.entry(key).or_default().push(c);
        }

        let mut anomalies = Vec::with_capacity(groups.len());
        for group in groups.into_values() {
            // One opinion per detector kind: keep its most confident candidate
            let mut best: BTreeMap<DetectorKind, &AnomalyCandidate> = BTreeMap::new();
            for c in &group {
                match best.get(&c.detector) {
                    Some(prev) if prev.confidence >= c.confidence => {}
                    _ => {
                        best.insert(c.detector, c);
                    }
                }
            }

            let mut miss_product = 1.0;
            let mut sources = BTreeSet::new();
            let mut magnitude_pct: f64 = 0.0;
            for (kind, c) in &best {
                let w = self.weight(*kind).clamp(0.0, 1.0);
                miss_product *= 1.0 - (w * c.confidence).clamp(0.0, 1.0);
                sources.insert(*kind);
                magnitude_pct = magnitude_pct.max(c.magnitude_pct());
            }
            let confidence = 1.0 - miss_product;

            let sample = best.values().next().expect("group is non-empty");
            anomalies.push(Anomaly {
                id: anomaly_id(&sample.entity, &sample.metric, sample.day, sample.direction),
                entity: sample.entity.clone(),
                metric: sample.metric.clone(),
                day: sample.day,
                direction: sample.direction,
                severity: self.severity_for(confidence),
                confidence,
                sources,
                magnitude_pct,
                status: AnomalyStatus::New,
                created_at: Utc::now(),
                resolved_at: None,
            });
        }

        anomalies
    }
}
