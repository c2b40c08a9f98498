//! TOML configuration for the driftwatch daemon.
//!
//! Layered model with sensible defaults, environment variable override for
//! the config file path, and a standard filesystem location. Every section
//! and field falls back to its default when absent, so a partial file is
//! always valid.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the driftwatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub severity: SeverityBands,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `DRIFTWATCH_CONFIG` environment variable.
    /// 2. `/etc/driftwatch/driftwatch.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("DRIFTWATCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "DRIFTWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/driftwatch/driftwatch.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Detector thresholds and fusion weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Default z-score threshold for the statistical detector.
    pub z_threshold: f64,
    /// Z-score at which statistical confidence saturates at 1.0.
    pub z_ceiling: f64,
    /// Per-metric z-score threshold overrides, keyed by metric name.
    pub metric_thresholds: HashMap<String, f64>,
    /// Minimum trailing-window population before any detector will score a point.
    pub min_baseline: usize,
    /// Trailing window length fed to the detectors, in days.
    pub window_days: u32,
    /// Per-detector confidence weights. Need not sum to 1; each scales
    /// how much one method's opinion is trusted during fusion.
    pub weight_statistical: f64,
    pub weight_outlier: f64,
    pub weight_forecast: f64,
    /// Outlier-score percentile above which a point becomes a candidate.
    pub outlier_percentile: f64,
    /// Seasonal period for the forecast detector (days).
    pub forecast_period: usize,
    /// Forecast confidence band half-width, in residual standard deviations.
    pub forecast_band_sigma: f64,
    /// Anomalies older than this transition to resolved once their metric
    /// is back within baseline.
    pub retention_days: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            z_ceiling: 6.0,
            metric_thresholds: HashMap::new(),
            min_baseline: 10,
            window_days: 90,
            weight_statistical: 0.4,
            weight_outlier: 0.3,
            weight_forecast: 0.3,
            outlier_percentile: 0.95,
            forecast_period: 7,
            forecast_band_sigma: 2.0,
            retention_days: 30,
        }
    }
}

impl DetectionConfig {
    /// Effective z-score threshold for a metric (per-metric override or default).
    pub fn threshold_for(&self, metric: &str) -> f64 {
        self.metric_thresholds
            .get(metric)
            .copied()
            .unwrap_or(self.z_threshold)
    }
}

// ---------------------------------------------------------------------------
// Severity bands
// ---------------------------------------------------------------------------

/// Cutoffs mapping combined confidence to severity. Two cutoffs make the
/// bands total and non-overlapping by construction: [0, medium_at) is low,
/// [medium_at, high_at) is medium, [high_at, 1] is high.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityBands {
    pub medium_at: f64,
    pub high_at: f64,
}

impl Default for SeverityBands {
    fn default() -> Self {
        Self {
            medium_at: 0.5,
            high_at: 0.8,
        }
    }
}

impl SeverityBands {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.medium_at && self.medium_at < self.high_at && self.high_at < 1.0) {
            anyhow::bail!(
                "severity bands must satisfy 0 < medium_at < high_at < 1 (got {} / {})",
                self.medium_at,
                self.high_at
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Notification queue and dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Transient failures are retried up to this many attempts, then the job
    /// is dead-lettered.
    pub max_attempts: u32,
    /// First retry delay (seconds). Doubles per attempt.
    pub backoff_base_secs: u64,
    /// Upper bound on any single retry delay (seconds).
    pub backoff_cap_secs: u64,
    /// Jitter applied to each computed delay, as a fraction of the delay.
    pub jitter_frac: f64,
    /// Dispatcher worker pool size.
    pub workers: usize,
    /// Bound on a single channel send.
    pub send_timeout_secs: u64,
    /// Idle worker poll interval when the queue is empty.
    pub poll_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
            jitter_frac: 0.2,
            workers: 4,
            send_timeout_secs: 10,
            poll_interval_secs: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Scan scheduling
// ---------------------------------------------------------------------------

/// Periodic detection scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Cron expression (with seconds field) for the detection scan.
    pub cron: String,
    /// Suppression window flush cadence while serving (seconds).
    pub flush_interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 * * * *".to_string(), // hourly
            flush_interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Destinations for the reference channel adapters. An unset destination
/// disables the channel; rules targeting it are rejected at load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Chat webhook URL (Slack-compatible incoming webhook).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_webhook_url: Option<String>,
    /// HTTP mail relay endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_relay_url: Option<String>,
    /// Recipient address passed to the mail relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_to: Option<String>,
    /// Generic webhook URL receiving the full alert JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

/// One operator-defined alert rule, as written in the config file.
/// Validation happens in `alert::rules::RuleSet::load`, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub name: String,
    /// Entity scope filter: rule applies to entities starting with this
    /// prefix. Empty matches everything.
    #[serde(default)]
    pub entity_prefix: String,
    /// Metrics the rule applies to. Empty matches every metric.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Minimum anomaly severity: "low", "medium", "high".
    #[serde(default = "default_min_severity")]
    pub min_severity: String,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default)]
    pub min_magnitude_pct: f64,
    /// Optional alert severity override: "low", "medium", "high". When
    /// unset, the alert inherits the anomaly's severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_override: Option<String>,
    /// Target channels: "chat", "email", "webhook".
    pub channels: Vec<String>,
    #[serde(default = "default_suppression_window")]
    pub suppression_window_secs: u64,
    /// "none" or "digest".
    #[serde(default = "default_aggregation")]
    pub aggregation: String,
    /// Digest mode flushes early once this many alerts accumulate.
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,
}

fn default_min_severity() -> String {
    "low".to_string()
}

fn default_suppression_window() -> u64 {
    86_400 // 24h
}

fn default_aggregation() -> String {
    "none".to_string()
}

fn default_burst_threshold() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
