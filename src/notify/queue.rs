//! SQLite-backed notification queue.
//!
//! Jobs survive restarts; claims are atomic. Dequeue order is severity rank
//! first, then FIFO within a rank, and a job waiting out its backoff stays
//! in the table rather than occupying a worker.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelKind, SendOutcome};
use crate::config::DeliveryConfig;
use crate::fusion::Severity;
use crate::notify::{backoff, DeliveryAttempt, JobStatus, NotificationJob};
use crate::storage::Pool;

#[derive(Clone)]
pub struct NotificationQueue {
    pool: Pool,
}

impl NotificationQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a job for (alert, channel). At most one ever exists per pair;
    /// a duplicate enqueue is a no-op returning `None`.
    pub fn enqueue(
        &self,
        alert_id: Uuid,
        channel: ChannelKind,
        severity: Severity,
        payload: &serde_json::Value,
    ) -> Result<Option<Uuid>> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO notification_jobs
                (id, alert_id, channel, payload_json, severity_rank,
                 attempts, next_attempt_at, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 'queued', ?6, ?6)",
            params![
                id.to_string(),
                alert_id.to_string(),
                channel.as_str(),
                serde_json::to_string(payload)?,
                severity.rank(),
                now,
            ],
        )?;

        if inserted == 0 {
            debug!(%alert_id, channel = %channel, "job already enqueued, skipping");
            return Ok(None);
        }
        debug!(%alert_id, channel = %channel, job = %id, "notification job enqueued");
        Ok(Some(id))
    }

    /// Atomically claim the best runnable job: highest severity rank first,
    /// oldest first within a rank. Claimed jobs move to `in_flight`.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<NotificationJob>> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to open claim transaction")?;

        let job = tx
            .query_row(
                "SELECT id, alert_id, channel, payload_json, severity_rank,
                        attempts, next_attempt_at, status, created_at
                 FROM notification_jobs
                 WHERE status IN ('queued', 'failed') AND next_attempt_at <= ?1
                 ORDER BY severity_rank DESC, created_at ASC, id ASC
                 LIMIT 1",
                params![now.to_rfc3339()],
                row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE notification_jobs SET status = 'in_flight', updated_at = ?2 WHERE id = ?1",
            params![job.id.to_string(), Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        job.status = JobStatus::InFlight;
        Ok(Some(job))
    }

    /// Apply a send outcome to an in-flight job and append the attempt
    /// record. Returns the job's new status.
    pub fn complete_attempt(
        &self,
        job: &NotificationJob,
        outcome: SendOutcome,
        error: Option<String>,
        delivery: &DeliveryConfig,
    ) -> Result<JobStatus> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to open completion transaction")?;

        let attempt = job.attempts + 1;
        let now = Utc::now();

        tx.execute(
            "INSERT INTO delivery_attempts (job_id, attempt, channel, outcome, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.to_string(),
                attempt,
                job.channel.as_str(),
                outcome.as_str(),
                error,
                now.to_rfc3339(),
            ],
        )?;

        let status = match outcome {
            SendOutcome::Success => JobStatus::Delivered,
            SendOutcome::PermanentFailure => JobStatus::Dead,
            SendOutcome::TransientFailure => {
                if attempt >= delivery.max_attempts {
                    JobStatus::Dead
                } else {
                    JobStatus::Failed
                }
            }
        };

        let next_attempt_at = if status == JobStatus::Failed {
            now + backoff::delay(delivery, attempt)
        } else {
            now
        };

        tx.execute(
            "UPDATE notification_jobs
             SET status = ?2, attempts = ?3, next_attempt_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                job.id.to_string(),
                status.as_str(),
                attempt,
                next_attempt_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        match status {
            JobStatus::Delivered => {
                info!(job = %job.id, channel = %job.channel, attempt, "notification delivered")
            }
            JobStatus::Dead => {
                warn!(job = %job.id, channel = %job.channel, attempt, "notification dead-lettered")
            }
            _ => debug!(
                job = %job.id,
                attempt,
                retry_at = %next_attempt_at.to_rfc3339(),
                "transient failure, requeued with backoff"
            ),
        }

        Ok(status)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<NotificationJob>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT id, alert_id, channel, payload_json, severity_rank,
                        attempts, next_attempt_at, status, created_at
                 FROM notification_jobs WHERE id = ?1",
                params![id.to_string()],
                row_to_job,
            )
            .optional()?)
    }

    /// Jobs for one alert, for the no-silent-loss checks.
    pub fn jobs_for_alert(&self, alert_id: Uuid) -> Result<Vec<NotificationJob>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, alert_id, channel, payload_json, severity_rank,
                    attempts, next_attempt_at, status, created_at
             FROM notification_jobs WHERE alert_id = ?1",
        )?;
        let rows = stmt.query_map(params![alert_id.to_string()], row_to_job)?;
        let mut jobs = Vec::new();
        for r in rows {
            jobs.push(r?);
        }
        Ok(jobs)
    }

    /// Dead-lettered jobs awaiting operator review.
    pub fn dead_letters(&self) -> Result<Vec<NotificationJob>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, alert_id, channel, payload_json, severity_rank,
                    attempts, next_attempt_at, status, created_at
             FROM notification_jobs WHERE status = 'dead' ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        let mut jobs = Vec::new();
        for r in rows {
            jobs.push(r?);
        }
        Ok(jobs)
    }

    /// Manual replay of a dead-lettered job: back to the queue with a fresh
    /// attempt budget.
    pub fn replay(&self, id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE notification_jobs
             SET status = 'queued', attempts = 0, next_attempt_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'dead'",
            params![id.to_string(), now],
        )?;
        if changed > 0 {
            info!(job = %id, "dead-lettered job requeued for replay");
        }
        Ok(changed > 0)
    }

    /// Audit trail for one job.
    pub fn attempts(&self, job_id: Uuid) -> Result<Vec<DeliveryAttempt>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, attempt, channel, outcome, error, created_at
             FROM delivery_attempts WHERE job_id = ?1 ORDER BY attempt ASC",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| {
            let job_str: String = row.get(0)?;
            let channel_str: String = row.get(2)?;
            let outcome_str: String = row.get(3)?;
            let created_str: String = row.get(5)?;
            Ok(DeliveryAttempt {
                job_id: Uuid::parse_str(&job_str).unwrap_or_default(),
                attempt: row.get(1)?,
                channel: ChannelKind::from_str(&channel_str).unwrap_or(ChannelKind::Webhook),
                outcome: match outcome_str.as_str() {
                    "success" => SendOutcome::Success,
                    "permanent_failure" => SendOutcome::PermanentFailure,
                    _ => SendOutcome::TransientFailure,
                },
                error: row.get(4)?,
                created_at: DateTime::parse_from_rfc3339(&created_str)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;
        let mut attempts = Vec::new();
        for r in rows {
            attempts.push(r?);
        }
        Ok(attempts)
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<NotificationJob> {
    let id_str: String = row.get(0)?;
    let alert_str: String = row.get(1)?;
    let channel_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let next_str: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(NotificationJob {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        alert_id: Uuid::parse_str(&alert_str).unwrap_or_default(),
        channel: ChannelKind::from_str(&channel_str).unwrap_or(ChannelKind::Webhook),
        payload: serde_json::from_str(&payload_str).unwrap_or_default(),
        severity_rank: row.get(4)?,
        attempts: row.get(5)?,
        next_attempt_at: DateTime::parse_from_rfc3339(&next_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Queued),
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}
