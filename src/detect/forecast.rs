//! Seasonal forecast deviation detector.
//!
//! Fits an additive decomposition (trend + seasonal + residual) on the
//! trailing history and flags observations falling outside the forecast's
//! confidence band. Seasonal positions are calendar-aligned so gaps in the
//! series do not shift the phase.

use chrono::Datelike;

use crate::config::DetectionConfig;
use crate::detect::{mean_std, AnomalyCandidate, Detector, DetectorKind, Direction};
use crate::metrics::MetricPoint;

pub struct ForecastDetector;

struct Decomposition {
    /// Trend level at the end of the history.
    level: f64,
    /// Per-step trend slope near the end of the history.
    slope: f64,
    /// Mean detrended value per calendar position.
    seasonal: Vec<f64>,
    residual_std: f64,
}

impl Detector for ForecastDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Forecast
    }

    fn detect(&self, series: &[MetricPoint], cfg: &DetectionConfig) -> Vec<AnomalyCandidate> {
        let mut candidates = Vec::new();
        let period = cfg.forecast_period.max(2);
        // Needs at least two full seasonal cycles of history
        let min_history = (2 * period).max(cfg.min_baseline);

        for i in min_history..series.len() {
            let history = &series[..i];
            let Some(dec) = decompose(history, period) else {
                continue;
            };

            let point = &series[i];
            let steps = (point.day - history[history.len() - 1].day).num_days();
            if steps <= 0 {
                continue;
            }

            let forecast =
                dec.level + dec.slope * steps as f64 + dec.seasonal[season_pos(point, period)];
            // Floor keeps float noise on a perfectly regular history from
            // registering as a zero-width band violation
            let band = (cfg.forecast_band_sigma * dec.residual_std)
                .max(1e-6 * forecast.abs().max(1.0));
            let deviation = (point.value - forecast).abs();

            if deviation > band {
                let confidence = ((deviation - band) / band).min(1.0);
                candidates.push(AnomalyCandidate {
                    entity: point.entity.clone(),
                    metric: point.metric.clone(),
                    day: point.day,
                    detector: DetectorKind::Forecast,
                    score: deviation / band,
                    confidence,
                    direction: Direction::from_deviation(point.value, forecast),
                    observed: point.value,
                    expected: forecast,
                });
            }
        }

        candidates
    }
}

/// Calendar-aligned seasonal position of a point.
fn season_pos(point: &MetricPoint, period: usize) -> usize {
    (point.day.num_days_from_ce().rem_euclid(period as i32)) as usize
}

/// Additive decomposition over the history: centered moving average trend,
/// per-position seasonal means, residual spread.
fn decompose(history: &[MetricPoint], period: usize) -> Option<Decomposition> {
    let n = history.len();
    if n < 2 * period {
        return None;
    }

    let values: Vec<f64> = history.iter().map(|p| p.value).collect();

    // Centered moving average trend over the interior, edges extended along
    // the interior slope so a trending series forecasts correctly
    let half = period / 2;
    let mut trend = vec![0.0; n];
    for i in half..(n - half) {
        let window = &values[i - half..=i + half];
        trend[i] = window.iter().sum::<f64>() / window.len() as f64;
    }
    let first_valid = half;
    let last_valid = n - half - 1;
    let slope = if last_valid > first_valid {
        (trend[last_valid] - trend[first_valid]) / (last_valid - first_valid) as f64
    } else {
        0.0
    };
    for i in 0..first_valid {
        trend[i] = trend[first_valid] - slope * (first_valid - i) as f64;
    }
    for i in (last_valid + 1)..n {
        trend[i] = trend[last_valid] + slope * (i - last_valid) as f64;
    }

    // Seasonal component: mean detrended value per calendar position
    let mut sums = vec![0.0; period];
    let mut counts = vec![0usize; period];
    for (i, point) in history.iter().enumerate() {
        let pos = season_pos(point, period);
        sums[pos] += values[i] - trend[i];
        counts[pos] += 1;
    }
    let seasonal: Vec<f64> = sums
        .iter()
        .zip(counts.iter())
        .map(|(s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect();

    // Residuals
    let residuals: Vec<f64> = history
        .iter()
        .enumerate()
        .map(|(i, point)| values[i] - trend[i] - seasonal[season_pos(point, period)])
        .collect();
    let (_, residual_std) = mean_std(&residuals);

    Some(Decomposition {
        level: trend[n - 1],
        slope,
        seasonal,
        residual_std,
    })
}
