//! Suppression windows and digest aggregation.
//!
//! One open window exists per dedup key at any time (enforced by a partial
//! unique index), and every admit runs inside an IMMEDIATE transaction, so
//! concurrent admitters for the same key serialize: exactly one of them is
//! the first admitter.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::alert::rules::{Aggregation, LoadedRule};
use crate::alert::Alert;
use crate::storage::Pool;

/// What happened to an alert at the suppression gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First occurrence in its window; deliver it.
    New,
    /// Repeat inside an active window; swallowed.
    Suppressed { count: i64 },
    /// Accumulated into a pending digest.
    Aggregated { pending: i64 },
}

/// A digest ready to become one combined notification.
#[derive(Debug, Clone)]
pub struct DigestDue {
    pub rule_id: String,
    pub dedup_key: Uuid,
    /// Total alerts summarized, first occurrence included.
    pub count: i64,
    pub summaries: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Result of one admit call. `flushed` carries a digest whose window this
/// admit happened to close (expiry observed on arrival, or burst).
#[derive(Debug)]
pub struct AdmitOutcome {
    pub admission: Admission,
    pub flushed: Option<DigestDue>,
}

struct OpenWindow {
    id: i64,
    dedup_key: String,
    rule_id: String,
    window_start: String,
    window_end: String,
    suppressed_count: i64,
    mode: String,
    summaries: Vec<String>,
}

pub struct Suppressor {
    pool: Pool,
}

impl Suppressor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Serialize-and-decide for one alert. Opens a window on first
    /// occurrence, counts repeats, accumulates digests, and flushes a
    /// digest early when the burst threshold is crossed.
    pub fn admit(&self, alert: &Alert, rule: &LoadedRule, now: DateTime<Utc>) -> Result<AdmitOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to open admit transaction")?;

        let mut flushed = None;

        let open = load_open_window(&tx, alert.dedup_key)?;
        let open = match open {
            Some(w) if now >= parse_ts(&w.window_end) => {
                // Window expired before this arrival: close it and harvest
                // any pending digest
                close_window(&tx, w.id)?;
                if w.mode == "digest" && !w.summaries.is_empty() {
                    flushed = Some(digest_from(&w));
                }
                None
            }
            other => other,
        };

        let admission = match open {
            None => {
                let window_end = now + rule.suppression_window;
                let (mode, digest_json, admission) = match rule.aggregation {
                    Aggregation::None => ("none", "[]".to_string(), Admission::New),
                    Aggregation::Digest => (
                        "digest",
                        serde_json::to_string(&[alert.title.clone()])?,
                        Admission::Aggregated { pending: 1 },
                    ),
                };
                tx.execute(
                    "INSERT INTO suppressions
                        (dedup_key, rule_id, window_start, window_end, suppressed_count, mode, digest_json)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                    params![
                        alert.dedup_key.to_string(),
                        rule.id,
                        now.to_rfc3339(),
                        window_end.to_rfc3339(),
                        mode,
                        digest_json,
                    ],
                )?;
                debug!(dedup_key = %alert.dedup_key, rule = %rule.id, "suppression window opened");
                admission
            }
            Some(w) => {
                let count = w.suppressed_count + 1;
                if w.mode == "digest" {
                    let mut summaries = w.summaries.clone();
                    summaries.push(alert.title.clone());

                    if summaries.len() as u32 >= rule.burst_threshold {
                        // Burst: flush immediately rather than waiting for
                        // the window to expire
                        close_window(&tx, w.id)?;
                        tx.execute(
                            "UPDATE suppressions SET suppressed_count = ?2, digest_json = ?3 WHERE id = ?1",
                            params![w.id, count, serde_json::to_string(&summaries)?],
                        )?;
                        flushed = Some(DigestDue {
                            rule_id: w.rule_id.clone(),
                            dedup_key: alert.dedup_key,
                            count: summaries.len() as i64,
                            summaries,
                            window_start: parse_ts(&w.window_start),
                            window_end: now,
                        });
                    } else {
                        tx.execute(
                            "UPDATE suppressions SET suppressed_count = ?2, digest_json = ?3 WHERE id = ?1",
                            params![w.id, count, serde_json::to_string(&summaries)?],
                        )?;
                    }
                    Admission::Aggregated { pending: count + 1 }
                } else {
                    tx.execute(
                        "UPDATE suppressions SET suppressed_count = ?2 WHERE id = ?1",
                        params![w.id, count],
                    )?;
                    Admission::Suppressed { count }
                }
            }
        };

        tx.commit()?;
        Ok(AdmitOutcome { admission, flushed })
    }

    /// Close every expired window and return the digests that were pending
    /// in them. Housekeeping calls this on a fixed tick.
    pub fn flush_due(&self, now: DateTime<Utc>) -> Result<Vec<DigestDue>> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to open flush transaction")?;

        let expired: Vec<OpenWindow> = {
            let mut stmt = tx.prepare(
                "SELECT id, dedup_key, rule_id, window_start, window_end, suppressed_count, mode, digest_json
                 FROM suppressions WHERE closed = 0 AND window_end <= ?1",
            )?;
            let rows = stmt.query_map(params![now.to_rfc3339()], row_to_window)?;
            rows.collect::<Result<_, _>>()?
        };

        let mut due = Vec::new();
        for w in expired {
            close_window(&tx, w.id)?;
            if w.mode == "digest" && !w.summaries.is_empty() {
                due.push(digest_from(&w));
            }
        }

        tx.commit()?;
        Ok(due)
    }

    /// Suppressed-repeat count for an open window, for the API surface.
    pub fn open_window_count(&self, dedup_key: Uuid) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT suppressed_count FROM suppressions WHERE dedup_key = ?1 AND closed = 0",
                params![dedup_key.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn load_open_window(tx: &Transaction<'_>, dedup_key: Uuid) -> Result<Option<OpenWindow>> {
    Ok(tx
        .query_row(
            "SELECT id, dedup_key, rule_id, window_start, window_end, suppressed_count, mode, digest_json
             FROM suppressions WHERE dedup_key = ?1 AND closed = 0",
            params![dedup_key.to_string()],
            row_to_window,
        )
        .optional()?)
}

fn row_to_window(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpenWindow> {
    let digest_str: String = row.get(7)?;
    Ok(OpenWindow {
        id: row.get(0)?,
        dedup_key: row.get(1)?,
        rule_id: row.get(2)?,
        window_start: row.get(3)?,
        window_end: row.get(4)?,
        suppressed_count: row.get(5)?,
        mode: row.get(6)?,
        summaries: serde_json::from_str(&digest_str).unwrap_or_default(),
    })
}

fn close_window(tx: &Transaction<'_>, id: i64) -> Result<()> {
    tx.execute("UPDATE suppressions SET closed = 1 WHERE id = ?1", params![id])?;
    Ok(())
}

fn digest_from(w: &OpenWindow) -> DigestDue {
    DigestDue {
        rule_id: w.rule_id.clone(),
        dedup_key: Uuid::parse_str(&w.dedup_key).unwrap_or_default(),
        count: w.summaries.len() as i64,
        summaries: w.summaries.clone(),
        window_start: parse_ts(&w.window_start),
        window_end: parse_ts(&w.window_end),
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}
