//! Durable notification delivery: queue, backoff, dispatcher.

pub mod backoff;
pub mod dispatcher;
pub mod queue;

pub use dispatcher::Dispatcher;
pub use queue::NotificationQueue;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::channel::{ChannelKind, SendOutcome};

/// Lifecycle of a notification job.
///
/// `queued -> in_flight -> {delivered | failed -> queued again | dead}`;
/// `failed` is a job waiting out its backoff. Delivered and dead are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InFlight,
    Delivered,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InFlight => "in_flight",
            JobStatus::Delivered => "delivered",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Delivered | JobStatus::Dead)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_flight" => Ok(JobStatus::InFlight),
            "delivered" => Ok(JobStatus::Delivered),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One unit of delivery work. At most one exists per (alert, channel).
#[derive(Debug, Clone, Serialize)]
pub struct NotificationJob {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub channel: ChannelKind,
    pub payload: serde_json::Value,
    pub severity_rank: i64,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// One send try, appended per attempt regardless of outcome. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub job_id: Uuid,
    pub attempt: u32,
    pub channel: ChannelKind,
    pub outcome: SendOutcome,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
