//! Anomaly fusion: canonical, de-duplicated findings.
//!
//! The three detectors each emit candidates per (entity, metric, day,
//! direction); fusion merges each group into one canonical `Anomaly` with a
//! combined confidence, and the store upserts it idempotently under a
//! monotonic ratchet.

pub mod engine;
pub mod store;

pub use engine::FusionEngine;
pub use store::AnomalyStore;

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::{DetectorKind, Direction};

/// Namespace for deterministic (content-hash) identifiers.
pub(crate) const ID_NAMESPACE: Uuid = Uuid::from_u128(0x9f2c_4d51_7a0e_4b3f_8d26_a1c5_e9b8_0742);

/// Severity levels for fused anomalies and the alerts they trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    /// Numeric rank used for queue priority ordering.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a canonical anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    New,
    Suppressed,
    Alerted,
    Resolved,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::New => "new",
            AnomalyStatus::Suppressed => "suppressed",
            AnomalyStatus::Alerted => "alerted",
            AnomalyStatus::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for AnomalyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(AnomalyStatus::New),
            "suppressed" => Ok(AnomalyStatus::Suppressed),
            "alerted" => Ok(AnomalyStatus::Alerted),
            "resolved" => Ok(AnomalyStatus::Resolved),
            other => Err(format!("unknown anomaly status: {other}")),
        }
    }
}

/// Canonical merged finding. The id is a content hash of
/// (entity, metric, day, direction), so re-detection can never create a
/// duplicate row -- it lands on the same id and merges.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub entity: String,
    pub metric: String,
    pub day: NaiveDate,
    pub direction: Direction,
    pub severity: Severity,
    pub confidence: f64,
    /// Detector kinds that agreed on this finding.
    pub sources: BTreeSet<DetectorKind>,
    /// Relative deviation from expectation, percent.
    pub magnitude_pct: f64,
    pub status: AnomalyStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Deterministic anomaly id. Direction is part of the identity: "above" and
/// "below" findings for the same day never merge.
pub fn anomaly_id(entity: &str, metric: &str, day: NaiveDate, direction: Direction) -> Uuid {
    let key = format!("{entity}|{metric}|{day}|{}", direction.as_str());
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_anomaly_id_is_deterministic() {
        let a = anomaly_id("page:/", "search.clicks", day("2026-07-01"), Direction::Above);
        let b = anomaly_id("page:/", "search.clicks", day("2026-07-01"), Direction::Above);
        assert_eq!(a, b);
    }

    #[test]
    fn test_direction_splits_identity() {
        let above = anomaly_id("page:/", "search.clicks", day("2026-07-01"), Direction::Above);
        let below = anomaly_id("page:/", "search.clicks", day("2026-07-01"), Direction::Below);
        assert_ne!(above, below);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("medium".parse::<Severity>().unwrap(), Severity::Medium);
    }
}
