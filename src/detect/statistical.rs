//! Rolling z-score detector.

use crate::config::DetectionConfig;
use crate::detect::{mean_std, AnomalyCandidate, Detector, DetectorKind, Direction};
use crate::metrics::MetricPoint;

/// Flags points deviating from a rolling mean/variance baseline beyond a
/// z-score threshold. The trailing window excludes the point under test.
pub struct StatisticalDetector;

impl Detector for StatisticalDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Statistical
    }

    fn detect(&self, series: &[MetricPoint], cfg: &DetectionConfig) -> Vec<AnomalyCandidate> {
        let mut candidates = Vec::new();
        if series.is_empty() {
            return candidates;
        }

        let threshold = cfg.threshold_for(&series[0].metric);

        for i in 0..series.len() {
            // Baseline = trailing window, point under test excluded
            if i < cfg.min_baseline {
                continue;
            }
            let window: Vec<f64> = series[..i].iter().map(|p| p.value).collect();
            let (mean, std) = mean_std(&window);
            let point = &series[i];

            let z = if std > f64::EPSILON {
                (point.value - mean) / std
            } else if (point.value - mean).abs() > f64::EPSILON {
                // Any deviation from a constant baseline is infinite z
                f64::INFINITY
            } else {
                0.0
            };

            if z.abs() > threshold {
                let confidence = (z.abs() / cfg.z_ceiling).min(1.0);
                candidates.push(AnomalyCandidate {
                    entity: point.entity.clone(),
                    metric: point.metric.clone(),
                    day: point.day,
                    detector: DetectorKind::Statistical,
                    score: z,
                    confidence,
                    direction: Direction::from_deviation(point.value, mean),
                    observed: point.value,
                    expected: mean,
                });
            }
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::series_from;

    fn cfg() -> DetectionConfig {
        DetectionConfig {
            min_baseline: 10,
            ..DetectionConfig::default()
        }
    }

    #[test]
    fn test_spike_is_flagged() {
        // 20 stable days around 100 with sigma ~10, then a 135 spike
        let mut values: Vec<f64> = (0..20)
            .map(|i| if i % 2 == 0 { 90.0 } else { 110.0 })
            .collect();
        values.push(135.0);
        let series = series_from(&values);

        let candidates = StatisticalDetector.detect(&series, &cfg());
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.direction, Direction::Above);
        assert!(c.score > 3.0, "z was {}", c.score);
        assert!(c.confidence > 0.5);
        assert!(c.confidence <= 1.0);
    }

    #[test]
    fn test_stable_series_is_quiet() {
        let values: Vec<f64> = (0..30).map(|i| 100.0 + (i % 3) as f64).collect();
        let candidates = StatisticalDetector.detect(&series_from(&values), &cfg());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_insufficient_history_emits_nothing() {
        let candidates = StatisticalDetector.detect(&series_from(&[100.0, 500.0]), &cfg());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_constant_baseline_deviation_saturates() {
        let mut values = vec![50.0; 15];
        values.push(80.0);
        let candidates = StatisticalDetector.detect(&series_from(&values), &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].confidence, 1.0);
    }

    #[test]
    fn test_drop_is_flagged_below() {
        let mut values: Vec<f64> = (0..20)
            .map(|i| if i % 2 == 0 { 95.0 } else { 105.0 })
            .collect();
        values.push(40.0);
        let candidates = StatisticalDetector.detect(&series_from(&values), &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].direction, Direction::Below);
    }

    #[test]
    fn test_per_metric_threshold_override() {
        let mut c = cfg();
        // Effectively disable detection for this metric
        c.metric_thresholds.insert("search.clicks".to_string(), 50.0);

        let mut values: Vec<f64> = (0..20)
            .map(|i| if i % 2 == 0 { 90.0 } else { 110.0 })
            .collect();
        values.push(135.0);
        let candidates = StatisticalDetector.detect(&series_from(&values), &c);
        assert!(candidates.is_empty());
    }
}
