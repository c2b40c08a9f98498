//! Metric store read contract.
//!
//! The collectors that populate per-entity time series live outside this
//! core; all the pipeline consumes is an ordered series per (entity, metric)
//! pair. Missing days are simply absent from the series -- never zero.

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::storage::Pool;

/// One observation for one (entity, metric) pair at day granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub entity: String,
    pub metric: String,
    pub day: NaiveDate,
    pub value: f64,
}

/// Read contract over the metric store.
pub trait MetricReader: Send + Sync {
    /// Ordered (ascending by day) series for one pair, at most `days` days
    /// ending at `until` inclusive.
    fn series(&self, entity: &str, metric: &str, until: NaiveDate, days: u32)
        -> Result<Vec<MetricPoint>>;

    /// Every distinct (entity, metric) pair with at least one observation.
    fn pairs(&self) -> Result<Vec<(String, String)>>;
}

/// Metric reader over the `metric_points` table.
#[derive(Clone)]
pub struct SqliteMetricReader {
    pool: Pool,
}

impl SqliteMetricReader {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl MetricReader for SqliteMetricReader {
    fn series(
        &self,
        entity: &str,
        metric: &str,
        until: NaiveDate,
        days: u32,
    ) -> Result<Vec<MetricPoint>> {
        let conn = self.pool.get()?;
        let since = until - chrono::Duration::days(days as i64);

        let mut stmt = conn.prepare(
            "SELECT day, value FROM metric_points
             WHERE entity = ?1 AND metric = ?2 AND day > ?3 AND day <= ?4
             ORDER BY day ASC",
        )?;

        let rows = stmt.query_map(
            rusqlite::params![
                entity,
                metric,
                since.format("%Y-%m-%d").to_string(),
                until.format("%Y-%m-%d").to_string()
            ],
            |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            },
        )?;

        let mut points = Vec::new();
        for r in rows {
            let (day_str, value) = r?;
            let Ok(day) = NaiveDate::parse_from_str(&day_str, "%Y-%m-%d") else {
                tracing::warn!(%entity, %metric, %day_str, "skipping metric point with unparseable day");
                continue;
            };
            points.push(MetricPoint {
                entity: entity.to_string(),
                metric: metric.to_string(),
                day,
                value,
            });
        }
        Ok(points)
    }

    fn pairs(&self) -> Result<Vec<(String, String)>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT entity, metric FROM metric_points ORDER BY entity, metric")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut pairs = Vec::new();
        for r in rows {
            pairs.push(r?);
        }
        Ok(pairs)
    }
}

/// Save one observation. Re-ingesting the same (entity, metric, day)
/// replaces the value, so collector backfills are idempotent.
pub fn record_point(pool: &Pool, point: &MetricPoint) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO metric_points (entity, metric, day, value)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (entity, metric, day) DO UPDATE SET value = excluded.value",
        rusqlite::params![
            point.entity,
            point.metric,
            point.day.format("%Y-%m-%d").to_string(),
            point.value
        ],
    )?;
    Ok(())
}

/// Bulk-load observations from a JSON-lines reader (one `MetricPoint` per
/// line). Used by the `ingest` subcommand for backfills.
pub fn ingest<R: std::io::BufRead>(pool: &Pool, reader: R) -> Result<usize> {
    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let point: MetricPoint = serde_json::from_str(&line)
            .map_err(|e| anyhow::anyhow!("bad metric point on line {}: {}", count + 1, e))?;
        record_point(pool, &point)?;
        count += 1;
    }
    Ok(count)
}
