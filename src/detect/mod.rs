//! Anomaly detection: three independent methods behind one contract.
//!
//! Each detector scores points of an ordered daily series against its own
//! model of "normal". A detector that cannot run (not enough history, model
//! unavailable) contributes nothing -- absence of a candidate is a valid
//! outcome, and fusion tolerates 1, 2, or 3 methods reporting.

pub mod forecast;
pub mod outlier;
pub mod statistical;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::metrics::MetricPoint;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
}

/// Which detection method produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Statistical,
    Outlier,
    Forecast,
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorKind::Statistical => write!(f, "statistical"),
            DetectorKind::Outlier => write!(f, "outlier"),
            DetectorKind::Forecast => write!(f, "forecast"),
        }
    }
}

/// Which side of baseline the observation fell on. Direction is part of an
/// anomaly's identity: an "above" and a "below" finding for the same day
/// are two distinct anomalies, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn from_deviation(observed: f64, expected: f64) -> Self {
        if observed >= expected {
            Direction::Above
        } else {
            Direction::Below
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Above => "above",
            Direction::Below => "below",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "above" => Ok(Direction::Above),
            "below" => Ok(Direction::Below),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// One detector's opinion about one observation. Consumed by fusion within
/// the same run, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyCandidate {
    pub entity: String,
    pub metric: String,
    pub day: NaiveDate,
    pub detector: DetectorKind,
    /// Method-specific raw score (z-score, Mahalanobis distance, band exceedance).
    pub score: f64,
    /// Normalized confidence in [0, 1].
    pub confidence: f64,
    pub direction: Direction,
    pub observed: f64,
    pub expected: f64,
}

impl AnomalyCandidate {
    /// Relative deviation of the observation from its expectation, percent.
    pub fn magnitude_pct(&self) -> f64 {
        if self.expected.abs() < f64::EPSILON {
            return 100.0;
        }
        ((self.observed - self.expected) / self.expected * 100.0).abs()
    }
}

/// Contract every detection method satisfies. Infallible: a series the
/// method cannot evaluate yields an empty result.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    fn detect(&self, series: &[MetricPoint], cfg: &DetectionConfig) -> Vec<AnomalyCandidate>;
}

/// Sample mean and standard deviation (n-1 denominator).
pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance_sum: f64 = values
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum();
    (mean, (variance_sum / (n - 1.0)).sqrt())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn series_from(values: &[f64]) -> Vec<MetricPoint> {
        let start = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| MetricPoint {
                entity: "page:/pricing".to_string(),
                metric: "search.clicks".to_string(),
                day: start + chrono::Duration::days(i as i64),
                value,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_std() {
        let (mean, std) = mean_std(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(mean, 3.0);
        // Sample std of 1..5 is sqrt(2.5) ~ 1.58
        assert!((std - 2.5f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_direction_from_deviation() {
        assert_eq!(Direction::from_deviation(135.0, 100.0), Direction::Above);
        assert_eq!(Direction::from_deviation(60.0, 100.0), Direction::Below);
    }

    #[test]
    fn test_magnitude_pct() {
        let c = AnomalyCandidate {
            entity: "e".into(),
            metric: "m".into(),
            day: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            detector: DetectorKind::Statistical,
            score: 3.5,
            confidence: 0.6,
            direction: Direction::Above,
            observed: 135.0,
            expected: 100.0,
        };
        assert!((c.magnitude_pct() - 35.0).abs() < 1e-9);
    }
}
