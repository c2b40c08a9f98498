//! Anomaly persistence with the monotonic upsert ratchet.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::detect::{mean_std, Direction, DetectorKind};
use crate::fusion::{Anomaly, AnomalyStatus, Severity};
use crate::metrics::MetricReader;
use crate::storage::Pool;

pub struct AnomalyStore {
    pool: Pool,
}

/// Query filters for listing anomalies.
#[derive(Debug, Default, Clone)]
pub struct AnomalyQuery {
    pub entity: Option<String>,
    pub status: Option<AnomalyStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: usize,
}

impl AnomalyStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Idempotent upsert keyed on the deterministic anomaly id.
    ///
    /// Runs in an IMMEDIATE transaction so two racing detector runs for the
    /// same id serialize: last writer merges, never overwrites downward.
    /// Within an active (non-resolved) lifetime, confidence and severity
    /// only ratchet up and contributing sets only grow. A resolved row is
    /// left untouched.
    ///
    /// Returns the merged row as stored.
    pub fn upsert(&self, anomaly: &Anomaly) -> Result<Anomaly> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to open upsert transaction")?;

        let existing = tx
            .query_row(
                "SELECT id, entity, metric, day, direction, severity, confidence,
                        sources_json, magnitude_pct, status, created_at, resolved_at
                 FROM anomalies WHERE id = ?1",
                params![anomaly.id.to_string()],
                row_to_anomaly,
            )
            .optional()?;

        let merged = match existing {
            None => {
                tx.execute(
                    "INSERT INTO anomalies
                        (id, entity, metric, day, direction, severity, confidence,
                         sources_json, magnitude_pct, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                    params![
                        anomaly.id.to_string(),
                        anomaly.entity,
                        anomaly.metric,
                        anomaly.day.format("%Y-%m-%d").to_string(),
                        anomaly.direction.as_str(),
                        anomaly.severity.as_str(),
                        anomaly.confidence,
                        sources_to_json(&anomaly.sources)?,
                        anomaly.magnitude_pct,
                        anomaly.status.as_str(),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                debug!(id = %anomaly.id, entity = %anomaly.entity, metric = %anomaly.metric, "anomaly created");
                anomaly.clone()
            }
            Some(current) if current.status == AnomalyStatus::Resolved => current,
            Some(current) => {
                let confidence = current.confidence.max(anomaly.confidence);
                let severity = current.severity.max(anomaly.severity);
                let magnitude_pct = current.magnitude_pct.max(anomaly.magnitude_pct);
                let sources: BTreeSet<DetectorKind> =
                    current.sources.union(&anomaly.sources).copied().collect();

                tx.execute(
                    "UPDATE anomalies
                     SET severity = ?2, confidence = ?3, sources_json = ?4,
                         magnitude_pct = ?5, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        current.id.to_string(),
                        severity.as_str(),
                        confidence,
                        sources_to_json(&sources)?,
                        magnitude_pct,
                        Utc::now().to_rfc3339(),
                    ],
                )?;

                Anomaly {
                    severity,
                    confidence,
                    magnitude_pct,
                    sources,
                    ..current
                }
            }
        };

        tx.commit()?;
        Ok(merged)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Anomaly>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT id, entity, metric, day, direction, severity, confidence,
                        sources_json, magnitude_pct, status, created_at, resolved_at
                 FROM anomalies WHERE id = ?1",
                params![id.to_string()],
                row_to_anomaly,
            )
            .optional()?)
    }

    pub fn list(&self, query: &AnomalyQuery) -> Result<Vec<Anomaly>> {
        let conn = self.pool.get()?;

        let mut sql = String::from(
            "SELECT id, entity, metric, day, direction, severity, confidence,
                    sources_json, magnitude_pct, status, created_at, resolved_at
             FROM anomalies WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(entity) = &query.entity {
            sql.push_str(" AND entity = ?");
            args.push(Box::new(entity.clone()));
        }
        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(from) = query.from {
            sql.push_str(" AND day >= ?");
            args.push(Box::new(from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = query.to {
            sql.push_str(" AND day <= ?");
            args.push(Box::new(to.format("%Y-%m-%d").to_string()));
        }
        sql.push_str(" ORDER BY day DESC, entity ASC LIMIT ?");
        let limit = if query.limit == 0 { 100 } else { query.limit as i64 };
        args.push(Box::new(limit));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_anomaly)?;

        let mut anomalies = Vec::new();
        for r in rows {
            anomalies.push(r?);
        }
        Ok(anomalies)
    }

    /// Advance status (new -> suppressed/alerted). Resolved rows stay put.
    pub fn set_status(&self, id: Uuid, status: AnomalyStatus) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE anomalies SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND status != 'resolved'",
            params![id.to_string(), status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Operator override: resolve regardless of retention or baseline state.
    pub fn force_resolve(&self, id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE anomalies SET status = 'resolved', resolved_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status != 'resolved'",
            params![id.to_string(), now],
        )?;
        if changed > 0 {
            info!(%id, "anomaly force-resolved");
        }
        Ok(changed > 0)
    }

    /// Resolve anomalies past the retention horizon whose metric has
    /// returned within the statistical baseline. Anomalies with no recent
    /// data to check resolve on the horizon alone.
    pub fn resolve_stale(
        &self,
        reader: &dyn MetricReader,
        detection: &DetectionConfig,
        today: NaiveDate,
    ) -> Result<usize> {
        let cutoff = today - chrono::Duration::days(detection.retention_days as i64);

        let stale: Vec<Anomaly> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT id, entity, metric, day, direction, severity, confidence,
                        sources_json, magnitude_pct, status, created_at, resolved_at
                 FROM anomalies WHERE status != 'resolved' AND day < ?1",
            )?;
            let rows = stmt.query_map(
                params![cutoff.format("%Y-%m-%d").to_string()],
                row_to_anomaly,
            )?;
            rows.collect::<Result<_, _>>()?
        };

        let mut resolved = 0;
        for anomaly in stale {
            let series = reader.series(&anomaly.entity, &anomaly.metric, today, detection.window_days)?;
            let back_within_baseline = match series.split_last() {
                Some((latest, rest)) if rest.len() >= detection.min_baseline => {
                    let window: Vec<f64> = rest.iter().map(|p| p.value).collect();
                    let (mean, std) = mean_std(&window);
                    let threshold = detection.threshold_for(&anomaly.metric);
                    std < f64::EPSILON || ((latest.value - mean) / std).abs() <= threshold
                }
                // Not enough data to judge; the horizon decides
                _ => true,
            };

            if back_within_baseline {
                self.force_resolve(anomaly.id)?;
                resolved += 1;
            }
        }

        if resolved > 0 {
            info!(count = resolved, "stale anomalies resolved");
        }
        Ok(resolved)
    }
}

fn sources_to_json(sources: &BTreeSet<DetectorKind>) -> Result<String> {
    Ok(serde_json::to_string(
        &sources.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
    )?)
}

fn row_to_anomaly(row: &Row<'_>) -> rusqlite::Result<Anomaly> {
    let id_str: String = row.get(0)?;
    let day_str: String = row.get(3)?;
    let direction_str: String = row.get(4)?;
    let severity_str: String = row.get(5)?;
    let sources_str: String = row.get(7)?;
    let status_str: String = row.get(9)?;
    let created_str: String = row.get(10)?;
    let resolved_str: Option<String> = row.get(11)?;

    let sources: BTreeSet<DetectorKind> = serde_json::from_str::<Vec<String>>(&sources_str)
        .unwrap_or_default()
        .iter()
        .filter_map(|s| match s.as_str() {
            "statistical" => Some(DetectorKind::Statistical),
            "outlier" => Some(DetectorKind::Outlier),
            "forecast" => Some(DetectorKind::Forecast),
            _ => None,
        })
        .collect();

    Ok(Anomaly {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        entity: row.get(1)?,
        metric: row.get(2)?,
        day: NaiveDate::parse_from_str(&day_str, "%Y-%m-%d").unwrap_or_default(),
        direction: Direction::from_str(&direction_str).unwrap_or(Direction::Above),
        severity: Severity::from_str(&severity_str).unwrap_or(Severity::Low),
        confidence: row.get(6)?,
        sources,
        magnitude_pct: row.get(8)?,
        status: AnomalyStatus::from_str(&status_str).unwrap_or(AnomalyStatus::New),
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        resolved_at: resolved_str.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::anomaly_id;
    use crate::metrics::{record_point, MetricPoint, SqliteMetricReader};
    use crate::storage::open_test_pool;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sample(confidence: f64, severity: Severity, sources: &[DetectorKind]) -> Anomaly {
        Anomaly {
            id: anomaly_id("page:/pricing", "search.clicks", day("2026-07-01"), Direction::Above),
            entity: "page:/pricing".into(),
            metric: "search.clicks".into(),
            day: day("2026-07-01"),
            direction: Direction::Above,
            severity,
            confidence,
            sources: sources.iter().copied().collect(),
            magnitude_pct: 35.0,
            status: AnomalyStatus::New,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = AnomalyStore::new(open_test_pool().unwrap());
        let a = sample(0.6, Severity::Medium, &[DetectorKind::Statistical]);

        store.upsert(&a).unwrap();
        store.upsert(&a).unwrap();

        let listed = store.list(&AnomalyQuery::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].confidence, 0.6);
    }

    #[test]
    fn test_ratchet_never_downgrades() {
        let store = AnomalyStore::new(open_test_pool().unwrap());
        store
            .upsert(&sample(0.9, Severity::High, &[DetectorKind::Statistical]))
            .unwrap();

        // A weaker re-detection must not lower anything
        let merged = store
            .upsert(&sample(0.4, Severity::Low, &[DetectorKind::Forecast]))
            .unwrap();

        assert_eq!(merged.confidence, 0.9);
        assert_eq!(merged.severity, Severity::High);
        // But the contributing set still grows
        assert_eq!(merged.sources.len(), 2);
    }

    #[test]
    fn test_ratchet_accepts_upgrades() {
        let store = AnomalyStore::new(open_test_pool().unwrap());
        store
            .upsert(&sample(0.4, Severity::Low, &[DetectorKind::Statistical]))
            .unwrap();
        let merged = store
            .upsert(&sample(0.85, Severity::High, &[DetectorKind::Outlier]))
            .unwrap();

        assert_eq!(merged.confidence, 0.85);
        assert_eq!(merged.severity, Severity::High);
    }

    #[test]
    fn test_resolved_rows_stay_resolved() {
        let store = AnomalyStore::new(open_test_pool().unwrap());
        let a = sample(0.6, Severity::Medium, &[DetectorKind::Statistical]);
        store.upsert(&a).unwrap();
        assert!(store.force_resolve(a.id).unwrap());

        let merged = store
            .upsert(&sample(0.95, Severity::High, &[DetectorKind::Forecast]))
            .unwrap();
        assert_eq!(merged.status, AnomalyStatus::Resolved);
        assert_eq!(merged.confidence, 0.6);
    }

    #[test]
    fn test_force_resolve_is_idempotent() {
        let store = AnomalyStore::new(open_test_pool().unwrap());
        let a = sample(0.6, Severity::Medium, &[DetectorKind::Statistical]);
        store.upsert(&a).unwrap();

        assert!(store.force_resolve(a.id).unwrap());
        assert!(!store.force_resolve(a.id).unwrap());
    }

    #[test]
    fn test_list_filters() {
        let store = AnomalyStore::new(open_test_pool().unwrap());
        store
            .upsert(&sample(0.6, Severity::Medium, &[DetectorKind::Statistical]))
            .unwrap();

        let by_entity = store
            .list(&AnomalyQuery {
                entity: Some("page:/pricing".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_entity.len(), 1);

        let other_entity = store
            .list(&AnomalyQuery {
                entity: Some("page:/docs".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(other_entity.is_empty());

        let resolved_only = store
            .list(&AnomalyQuery {
                status: Some(AnomalyStatus::Resolved),
                ..Default::default()
            })
            .unwrap();
        assert!(resolved_only.is_empty());
    }

    #[test]
    fn test_resolve_stale_when_back_at_baseline() {
        let pool = open_test_pool().unwrap();
        let store = AnomalyStore::new(pool.clone());
        let detection = DetectionConfig {
            retention_days: 30,
            min_baseline: 5,
            ..DetectionConfig::default()
        };

        // Anomaly 40 days old
        let mut old = sample(0.7, Severity::Medium, &[DetectorKind::Statistical]);
        old.id = anomaly_id("page:/pricing", "search.clicks", day("2026-05-20"), Direction::Above);
        old.day = day("2026-05-20");
        store.upsert(&old).unwrap();

        // Recent series sitting quietly at baseline
        let today = day("2026-07-01");
        for i in 0..10 {
            record_point(
                &pool,
                &MetricPoint {
                    entity: "page:/pricing".into(),
                    metric: "search.clicks".into(),
                    day: today - chrono::Duration::days(9 - i),
                    value: 100.0 + (i % 2) as f64,
                },
            )
            .unwrap();
        }

        let reader = SqliteMetricReader::new(pool);
        let resolved = store.resolve_stale(&reader, &detection, today).unwrap();
        assert_eq!(resolved, 1);

        let a = store.get(old.id).unwrap().unwrap();
        assert_eq!(a.status, AnomalyStatus::Resolved);
        assert!(a.resolved_at.is_some());
    }

    #[test]
    fn test_resolve_stale_skips_recent() {
        let pool = open_test_pool().unwrap();
        let store = AnomalyStore::new(pool.clone());
        let detection = DetectionConfig::default();

        let recent = sample(0.7, Severity::Medium, &[DetectorKind::Statistical]);
        store.upsert(&recent).unwrap();

        let reader = SqliteMetricReader::new(pool);
        let resolved = store
            .resolve_stale(&reader, &detection, day("2026-07-02"))
            .unwrap();
        assert_eq!(resolved, 0);
    }
}
