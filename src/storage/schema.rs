//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS metric_points (
            id INTEGER PRIMARY KEY,
            entity TEXT NOT NULL,
            metric TEXT NOT NULL,
            day TEXT NOT NULL,
            value REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (entity, metric, day)
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            metric TEXT NOT NULL,
            day TEXT NOT NULL,
            direction TEXT NOT NULL,
            severity TEXT NOT NULL,
            confidence REAL NOT NULL,
            sources_json TEXT NOT NULL,
            magnitude_pct REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL,
            anomaly_id TEXT,
            entity TEXT NOT NULL,
            metric TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            snapshot_json TEXT NOT NULL,
            dedup_key TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS suppressions (
            id INTEGER PRIMARY KEY,
            dedup_key TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            suppressed_count INTEGER NOT NULL DEFAULT 0,
            mode TEXT NOT NULL DEFAULT 'none',
            digest_json TEXT NOT NULL DEFAULT '[]',
            closed INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS notification_jobs (
            id TEXT PRIMARY KEY,
            alert_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            severity_rank INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (alert_id, channel)
        );

        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id INTEGER PRIMARY KEY,
            job_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            channel TEXT NOT NULL,
            outcome TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (job_id) REFERENCES notification_jobs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_metric_points_series ON metric_points(entity, metric, day);
        CREATE INDEX IF NOT EXISTS idx_anomalies_entity_day ON anomalies(entity, day);
        CREATE INDEX IF NOT EXISTS idx_anomalies_status ON anomalies(status);
        CREATE INDEX IF NOT EXISTS idx_alerts_dedup ON alerts(dedup_key);
        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON notification_jobs(status, next_attempt_at, severity_rank);
        CREATE INDEX IF NOT EXISTS idx_attempts_job ON delivery_attempts(job_id);

        -- One open suppression window per dedup key. Concurrent admitters
        -- race on this index inside IMMEDIATE transactions.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_suppressions_open
            ON suppressions(dedup_key) WHERE closed = 0;",
    )?;

    // Migration: add 'resolved_at' to anomalies if missing
    let has_resolved_at: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('anomalies') WHERE name='resolved_at'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_resolved_at == 0 {
        conn.execute("ALTER TABLE anomalies ADD COLUMN resolved_at TEXT", [])?;
    }

    Ok(())
}
