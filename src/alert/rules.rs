//! Rule loading, validation, and pure evaluation.
//!
//! Malformed rules fail fast at configuration load: they are logged,
//! excluded from evaluation, and kept queryable so an operator can see what
//! was rejected. Evaluation itself is pure and side-effect-free.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::alert::{dedup_key, Alert};
use crate::channel::{ChannelKind, ChannelRegistry};
use crate::config::RuleConfig;
use crate::fusion::{Anomaly, Severity};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule targets no channels")]
    EmptyChannels,
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("channel '{0}' has no configured destination")]
    UnconfiguredChannel(String),
    #[error("unknown severity '{0}'")]
    BadSeverity(String),
    #[error("min_confidence {0} outside [0, 1]")]
    BadConfidence(f64),
    #[error("min_magnitude_pct {0} must be non-negative")]
    BadMagnitude(f64),
    #[error("suppression window must be non-zero")]
    ZeroWindow,
    #[error("unknown aggregation mode '{0}' (expected 'none' or 'digest')")]
    BadAggregation(String),
    #[error("digest burst threshold must be at least 2, got {0}")]
    BurstTooSmall(u32),
}

/// How repeats inside a suppression window are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    None,
    Digest,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::None => "none",
            Aggregation::Digest => "digest",
        }
    }
}

/// A validated, evaluatable rule.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedRule {
    pub id: String,
    pub name: String,
    pub entity_prefix: String,
    /// Empty set matches every metric.
    pub metrics: BTreeSet<String>,
    pub min_severity: Severity,
    pub min_confidence: f64,
    pub min_magnitude_pct: f64,
    pub severity_override: Option<Severity>,
    pub channels: Vec<ChannelKind>,
    #[serde(skip)]
    pub suppression_window: Duration,
    pub aggregation: Aggregation,
    pub burst_threshold: u32,
}

/// A rule that failed validation, kept for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRule {
    pub id: String,
    pub name: String,
    pub reason: String,
}

/// The loaded rule set: valid rules plus the rejects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleSet {
    pub rules: Vec<LoadedRule>,
    pub rejected: Vec<RejectedRule>,
}

impl RuleSet {
    /// Validate every configured rule. Bad rules are excluded and logged;
    /// loading never aborts the pipeline.
    pub fn load(configs: &[RuleConfig], registry: &ChannelRegistry) -> Self {
        let mut set = RuleSet::default();

        for cfg in configs {
            match validate(cfg, registry) {
                Ok(rule) => set.rules.push(rule),
                Err(e) => {
                    error!(rule = %cfg.id, error = %e, "rule rejected at load");
                    set.rejected.push(RejectedRule {
                        id: cfg.id.clone(),
                        name: cfg.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            loaded = set.rules.len(),
            rejected = set.rejected.len(),
            "alert rules loaded"
        );
        set
    }

    pub fn get(&self, rule_id: &str) -> Option<&LoadedRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }
}

fn validate(cfg: &RuleConfig, registry: &ChannelRegistry) -> Result<LoadedRule, RuleError> {
    if cfg.channels.is_empty() {
        return Err(RuleError::EmptyChannels);
    }

    let mut channels = Vec::with_capacity(cfg.channels.len());
    for name in &cfg.channels {
        let kind = ChannelKind::from_str(name)
            .map_err(|_| RuleError::UnknownChannel(name.clone()))?;
        if !registry.is_configured(kind) {
            return Err(RuleError::UnconfiguredChannel(name.clone()));
        }
        channels.push(kind);
    }

    let min_severity = Severity::from_str(&cfg.min_severity)
        .map_err(|_| RuleError::BadSeverity(cfg.min_severity.clone()))?;

    let severity_override = cfg
        .severity_override
        .as_deref()
        .map(|s| Severity::from_str(s).map_err(|_| RuleError::BadSeverity(s.to_string())))
        .transpose()?;

    if !(0.0..=1.0).contains(&cfg.min_confidence) {
        return Err(RuleError::BadConfidence(cfg.min_confidence));
    }
    if cfg.min_magnitude_pct < 0.0 {
        return Err(RuleError::BadMagnitude(cfg.min_magnitude_pct));
    }
    if cfg.suppression_window_secs == 0 {
        return Err(RuleError::ZeroWindow);
    }

    let aggregation = match cfg.aggregation.as_str() {
        "none" => Aggregation::None,
        "digest" => Aggregation::Digest,
        other => return Err(RuleError::BadAggregation(other.to_string())),
    };
    if aggregation == Aggregation::Digest && cfg.burst_threshold < 2 {
        return Err(RuleError::BurstTooSmall(cfg.burst_threshold));
    }

    Ok(LoadedRule {
        id: cfg.id.clone(),
        name: cfg.name.clone(),
        entity_prefix: cfg.entity_prefix.clone(),
        metrics: cfg.metrics.iter().cloned().collect(),
        min_severity,
        min_confidence: cfg.min_confidence,
        min_magnitude_pct: cfg.min_magnitude_pct,
        severity_override,
        channels,
        suppression_window: Duration::seconds(cfg.suppression_window_secs as i64),
        aggregation,
        burst_threshold: cfg.burst_threshold,
    })
}

impl LoadedRule {
    /// Scope + condition check against one anomaly.
    fn matches(&self, anomaly: &Anomaly) -> bool {
        anomaly.entity.starts_with(&self.entity_prefix)
            && (self.metrics.is_empty() || self.metrics.contains(&anomaly.metric))
            && anomaly.severity >= self.min_severity
            && anomaly.confidence >= self.min_confidence
            && anomaly.magnitude_pct >= self.min_magnitude_pct
    }
}

/// Pure evaluation of the rule set against a trigger. Every matching rule
/// fires independently.
pub struct RuleEngine {
    rule_set: RuleSet,
}

impl RuleEngine {
    pub fn new(rule_set: RuleSet) -> Self {
        Self { rule_set }
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    pub fn evaluate(&self, anomaly: &Anomaly) -> Vec<Alert> {
        self.rule_set
            .rules
            .iter()
            .filter(|rule| rule.matches(anomaly))
            .map(|rule| {
                let severity = rule.severity_override.unwrap_or(anomaly.severity);
                let direction = anomaly.direction.as_str();
                Alert {
                    id: Uuid::new_v4(),
                    rule_id: rule.id.clone(),
                    anomaly_id: Some(anomaly.id),
                    entity: anomaly.entity.clone(),
                    metric: anomaly.metric.clone(),
                    severity,
                    title: format!("{}: {} {}", rule.name, anomaly.metric, direction),
                    message: format!(
                        "{} on {} was {:.1}% {} baseline on {} (confidence {:.2}, {} detector(s) agree)",
                        anomaly.metric,
                        anomaly.entity,
                        anomaly.magnitude_pct,
                        direction,
                        anomaly.day,
                        anomaly.confidence,
                        anomaly.sources.len(),
                    ),
                    snapshot: serde_json::json!({
                        "anomaly_id": anomaly.id,
                        "day": anomaly.day,
                        "direction": direction,
                        "confidence": anomaly.confidence,
                        "magnitude_pct": anomaly.magnitude_pct,
                        "sources": anomaly.sources,
                    }),
                    dedup_key: dedup_key(&rule.id, &anomaly.entity, &anomaly.metric, severity),
                    created_at: Utc::now(),
                }
            })
            .collect()
    }
}
