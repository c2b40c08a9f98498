//! Density-based outlier detector.
//!
//! Scores each point against a multivariate context of the trailing window:
//! raw value, offset from the same-weekday mean, and recent trend slope.
//! The scoring model sits behind the `OutlierScorer` trait so a trained
//! classifier can replace the built-in Mahalanobis scorer without touching
//! the fusion contract.

use chrono::Datelike;

use crate::config::DetectionConfig;
use crate::detect::{mean_std, AnomalyCandidate, Detector, DetectorKind, Direction};
use crate::metrics::MetricPoint;

/// Multivariate context for one observation.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    pub value: f64,
    /// Deviation from the mean of same-weekday observations in the window.
    pub weekday_offset: f64,
    /// Least-squares slope over the trailing week ending at this point.
    pub trend_slope: f64,
}

impl FeatureVector {
    fn dims(&self) -> [f64; 3] {
        [self.value, self.weekday_offset, self.trend_slope]
    }
}

/// Normal-vs-anomalous scoring function. Higher scores are more anomalous.
/// Returns `None` when the model cannot be fitted on the given history.
pub trait OutlierScorer: Send + Sync {
    fn score(&self, history: &[FeatureVector], point: &FeatureVector) -> Option<f64>;
}

/// Diagonal-covariance Mahalanobis distance over the feature dimensions.
pub struct MahalanobisScorer;

impl OutlierScorer for MahalanobisScorer {
    fn score(&self, history: &[FeatureVector], point: &FeatureVector) -> Option<f64> {
        if history.len() < 3 {
            return None;
        }

        let mut sum_sq = 0.0;
        for dim in 0..3 {
            let values: Vec<f64> = history.iter().map(|f| f.dims()[dim]).collect();
            let (mean, std) = mean_std(&values);
            // Degenerate dimensions contribute nothing rather than exploding
            if std <= 1e-9 {
                continue;
            }
            let z = (point.dims()[dim] - mean) / std;
            sum_sq += z * z;
        }

        Some((sum_sq / 3.0).sqrt())
    }
}

pub struct OutlierDetector {
    scorer: Box<dyn OutlierScorer>,
}

impl OutlierDetector {
    pub fn new(scorer: Box<dyn OutlierScorer>) -> Self {
        Self { scorer }
    }

    /// Detector with the built-in Mahalanobis scorer.
    pub fn mahalanobis() -> Self {
        Self::new(Box::new(MahalanobisScorer))
    }

    fn features(series: &[MetricPoint]) -> Vec<FeatureVector> {
        series
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let weekday = point.day.weekday();
                let same_weekday: Vec<f64> = series[..i]
                    .iter()
                    .filter(|p| p.day.weekday() == weekday)
                    .map(|p| p.value)
                    .collect();
                let weekday_offset = if same_weekday.is_empty() {
                    0.0
                } else {
                    let (mean, _) = mean_std(&same_weekday);
                    point.value - mean
                };

                let start = i.saturating_sub(6);
                let trend_slope = slope(&series[start..=i]);

                FeatureVector {
                    value: point.value,
                    weekday_offset,
                    trend_slope,
                }
            })
            .collect()
    }
}

impl Detector for OutlierDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Outlier
    }

    fn detect(&self, series: &[MetricPoint], cfg: &DetectionConfig) -> Vec<AnomalyCandidate> {
        let mut candidates = Vec::new();
        if series.len() <= cfg.min_baseline {
            return candidates;
        }

        let features = Self::features(series);

        for i in cfg.min_baseline..series.len() {
            let history = &features[..i];
            let Some(score) = self.scorer.score(history, &features[i]) else {
                continue;
            };

            // Cutoff = configured percentile of the window's own scores,
            // floored so a tightly clustered window does not flag noise.
            let mut window_scores: Vec<f64> = history
                .iter()
                .filter_map(|f| self.scorer.score(history, f))
                .collect();
            if window_scores.is_empty() {
                continue;
            }
            window_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((window_scores.len() - 1) as f64 * cfg.outlier_percentile) as usize;
            let cutoff = window_scores[idx].max(1.0);

            if score > cutoff {
                let point = &series[i];
                let window_values: Vec<f64> = series[..i].iter().map(|p| p.value).collect();
                let (expected, _) = mean_std(&window_values);
                candidates.push(AnomalyCandidate {
                    entity: point.entity.clone(),
                    metric: point.metric.clone(),
                    day: point.day,
                    detector: DetectorKind::Outlier,
                    score,
                    confidence: ((score - cutoff) / cutoff).min(1.0),
                    direction: Direction::from_deviation(point.value, expected),
                    observed: point.value,
                    expected,
                });
            }
        }

        candidates
    }
}

/// Least-squares slope of values against their index.
fn slope(points: &[MetricPoint]) -> f64 {
    let n = points.len();
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.value).collect();
    let (x_mean, _) = mean_std(&xs);
    let (y_mean, _) = mean_std(&ys);

    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        num += (xs[i] - x_mean) * (ys[i] - y_mean);
        den += (xs[i] - x_mean) * (xs[i] - x_mean);
    }
    if den.abs() < f64::EPSILON {
        0.0
    } else {
        num / den
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
    fn test_large_excursion_is_flagged() {
        let mut values: Vec<f64> = (0..28)
            .map(|i| 100.0 + ((i % 7) as f64) * 2.0)
            .collect();
        values.push(400.0);
        let candidates = OutlierDetector::mahalanobis().detect(&series_from(&values), &cfg());

        assert!(
            candidates.iter().any(|c| c.observed == 400.0),
            "excursion not flagged: {candidates:?}"
        );
        let c = candidates.iter().find(|c| c.observed == 400.0).unwrap();
        assert_eq!(c.direction, Direction::Above);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
    }

    #[test]
    fn test_short_series_emits_nothing() {
        let candidates =
            OutlierDetector::mahalanobis().detect(&series_from(&[1.0, 2.0, 3.0]), &cfg());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_scorer_is_swappable() {
        struct NeverAnomalous;
        impl OutlierScorer for NeverAnomalous {
            fn score(&self, _: &[FeatureVector], _: &FeatureVector) -> Option<f64> {
                Some(0.0)
            }
        }

        let mut values: Vec<f64> = (0..28).map(|i| 100.0 + (i % 7) as f64).collect();
        values.push(400.0);
        let candidates = OutlierDetector::new(Box::new(NeverAnomalous))
            .detect(&series_from(&values), &cfg());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_unavailable_model_is_not_an_error() {
        struct Unavailable;
        impl OutlierScorer for Unavailable {
            fn score(&self, _: &[FeatureVector], _: &FeatureVector) -> Option<f64> {
                None
            }
        }

        let values: Vec<f64> = (0..28).map(|i| 100.0 + (i % 7) as f64).collect();
        let candidates =
            OutlierDetector::new(Box::new(Unavailable)).detect(&series_from(&values), &cfg());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_slope() {
        let points = series_from(&[1.0, 2.0, 3.0, 4.0]);
        assert!((slope(&points) - 1.0).abs() < 1e-9);

        let flat = series_from(&[5.0, 5.0, 5.0]);
        assert!(slope(&flat).abs() < 1e-9);
    }
}
