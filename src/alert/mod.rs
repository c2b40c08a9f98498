//! Alert triggering and volume control.
//!
//! Rules are evaluated purely over canonical anomalies; matched alerts pass
//! through suppression before anything reaches the notification queue.

pub mod rules;
pub mod suppress;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::fusion::{Severity, ID_NAMESPACE};
use crate::storage::Pool;

/// One rule match instance. Immutable once created.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: String,
    /// Absent for non-anomaly trigger sources (digests).
    pub anomaly_id: Option<Uuid>,
    pub entity: String,
    pub metric: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    /// Snapshot of the triggering metrics, for the notification payload.
    pub snapshot: serde_json::Value,
    pub dedup_key: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Rendered payload handed to channel adapters.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "alert_id": self.id,
            "rule_id": self.rule_id,
            "entity": self.entity,
            "metric": self.metric,
            "severity": self.severity,
            "title": self.title,
            "message": self.message,
            "snapshot": self.snapshot,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Identity used to collapse repeated alerts into one suppression window:
/// a content hash of (rule, entity, metric, severity bucket).
pub fn dedup_key(rule_id: &str, entity: &str, metric: &str, severity: Severity) -> Uuid {
    let key = format!("{rule_id}|{entity}|{metric}|{}", severity.as_str());
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes())
}

/// Alert persistence. Status never mutates; only suppression bookkeeping
/// lives elsewhere.
pub struct AlertStore {
    pool: Pool,
}

impl AlertStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn insert(&self, alert: &Alert) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO alerts (id, rule_id, anomaly_id, entity, metric, severity,
                                 title, message, snapshot_json, dedup_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                alert.id.to_string(),
                alert.rule_id,
                alert.anomaly_id.map(|id| id.to_string()),
                alert.entity,
                alert.metric,
                alert.severity.as_str(),
                alert.title,
                alert.message,
                serde_json::to_string(&alert.snapshot)?,
                alert.dedup_key.to_string(),
                alert.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, anomaly_id, entity, metric, severity,
                    title, message, snapshot_json, dedup_key, created_at
             FROM alerts ORDER BY created_at DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let id_str: String = row.get(0)?;
            let anomaly_str: Option<String> = row.get(2)?;
            let severity_str: String = row.get(5)?;
            let snapshot_str: String = row.get(8)?;
            let dedup_str: String = row.get(9)?;
            let created_str: String = row.get(10)?;

            Ok(Alert {
                id: Uuid::parse_str(&id_str).unwrap_or_default(),
                rule_id: row.get(1)?,
                anomaly_id: anomaly_str.and_then(|s| Uuid::parse_str(&s).ok()),
                entity: row.get(3)?,
                metric: row.get(4)?,
                severity: severity_str.parse().unwrap_or(Severity::Low),
                title: row.get(6)?,
                message: row.get(7)?,
                snapshot: serde_json::from_str(&snapshot_str).unwrap_or_default(),
                dedup_key: Uuid::parse_str(&dedup_str).unwrap_or_default(),
                created_at: DateTime::parse_from_rfc3339(&created_str)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;

        let mut alerts = Vec::new();
        for r in rows {
            alerts.push(r?);
        }
        Ok(alerts)
    }
}
