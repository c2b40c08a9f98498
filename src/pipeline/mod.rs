//! Scan orchestration: detect, fuse, evaluate, admit, enqueue.
//!
//! One scan walks every (entity, metric) series through the detectors in
//! parallel, fuses the candidates, and pushes qualifying findings through
//! rules and suppression into the notification queue. Failures are isolated
//! per series and per anomaly; only storage unavailability aborts a run.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use cron::Schedule as CronSchedule;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alert::rules::{LoadedRule, RuleEngine};
use crate::alert::suppress::{Admission, DigestDue, Suppressor};
use crate::alert::{Alert, AlertStore};
use crate::config::Config;
use crate::detect::forecast::ForecastDetector;
use crate::detect::outlier::OutlierDetector;
use crate::detect::statistical::StatisticalDetector;
use crate::detect::{AnomalyCandidate, Detector};
use crate::fusion::{AnomalyStatus, AnomalyStore, FusionEngine};
use crate::metrics::{MetricReader, SqliteMetricReader};
use crate::notify::NotificationQueue;
use crate::storage::Pool;

/// What one scan did, for logging and the API response.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ScanSummary {
    pub pairs: usize,
    pub candidates: usize,
    pub anomalies: usize,
    pub alerts: usize,
    pub jobs: usize,
    pub resolved: usize,
    pub cancelled: bool,
}

pub struct Pipeline {
    pool: Pool,
    config: Arc<Config>,
    rule_engine: Arc<RuleEngine>,
}

impl Pipeline {
    pub fn new(pool: Pool, config: Arc<Config>, rule_engine: Arc<RuleEngine>) -> Self {
        Self {
            pool,
            config,
            rule_engine,
        }
    }

    pub fn rule_engine(&self) -> &RuleEngine {
        &self.rule_engine
    }

    /// Run one full detection scan over every known series.
    ///
    /// The run is cancellable between stages; work already started for the
    /// current stage completes.
    pub async fn run_scan(&self, today: NaiveDate, cancel: &watch::Receiver<bool>) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();

        // Stage 1: enumerate series
        let reader = SqliteMetricReader::new(self.pool.clone());
        let pairs = {
            let reader = reader.clone();
            tokio::task::spawn_blocking(move || reader.pairs())
                .await?
                .context("failed to enumerate metric series")?
        };
        summary.pairs = pairs.len();
        debug!(pairs = summary.pairs, "scan started");

        if *cancel.borrow() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Stage 2: detectors, parallel across independent series
        let detections = join_all(pairs.into_iter().map(|(entity, metric)| {
            let reader = reader.clone();
            let config = Arc::clone(&self.config);
            tokio::task::spawn_blocking(move || {
                detect_series(&reader, &config, &entity, &metric, today)
            })
        }))
        .await;

        let mut candidates: Vec<AnomalyCandidate> = Vec::new();
        for result in detections {
            match result? {
                Ok(mut series_candidates) => candidates.append(&mut series_candidates),
                // Contained: one broken series must not abort the others
                Err(e) => warn!(error = %e, "series detection failed, skipping"),
            }
        }
        summary.candidates = candidates.len();

        if *cancel.borrow() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Stage 3: fuse
        let engine = FusionEngine::new(&self.config.detection, self.config.severity.clone());
        let anomalies = engine.fuse(candidates);
        summary.anomalies = anomalies.len();

        if *cancel.borrow() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Stage 4: upsert, evaluate, admit, enqueue
        let (alerts, jobs) = {
            let pool = self.pool.clone();
            let rule_engine = Arc::clone(&self.rule_engine);
            tokio::task::spawn_blocking(move || trigger_alerts(&pool, &rule_engine, anomalies))
                .await??
        };
        summary.alerts = alerts;
        summary.jobs = jobs;

        // Stage 5: retention
        let resolved = {
            let pool = self.pool.clone();
            let config = Arc::clone(&self.config);
            tokio::task::spawn_blocking(move || {
                let store = AnomalyStore::new(pool.clone());
                let reader = SqliteMetricReader::new(pool);
                store.resolve_stale(&reader, &config.detection, today)
            })
            .await??
        };
        summary.resolved = resolved;

        info!(
            pairs = summary.pairs,
            candidates = summary.candidates,
            anomalies = summary.anomalies,
            alerts = summary.alerts,
            jobs = summary.jobs,
            resolved = summary.resolved,
            "scan finished"
        );
        Ok(summary)
    }

    /// Close expired suppression windows and turn pending digests into
    /// notification jobs. Called on a fixed tick while serving.
    pub fn flush_digests(&self) -> Result<usize> {
        let suppressor = Suppressor::new(self.pool.clone());
        let due = suppressor.flush_due(Utc::now())?;
        if due.is_empty() {
            return Ok(0);
        }

        let alert_store = AlertStore::new(self.pool.clone());
        let queue = NotificationQueue::new(self.pool.clone());

        let mut jobs = 0;
        for digest in due {
            match self.rule_engine.rule_set().get(&digest.rule_id) {
                Some(rule) => {
                    jobs += enqueue_digest(&digest, rule, &alert_store, &queue)?;
                }
                // The rule set changed underneath an open window; surface it
                None => error!(
                    rule = %digest.rule_id,
                    count = digest.count,
                    "digest due for a rule no longer loaded, dropping to log"
                ),
            }
        }
        Ok(jobs)
    }
}

/// Read one series and run all three detectors over it.
fn detect_series(
    reader: &dyn MetricReader,
    config: &Config,
    entity: &str,
    metric: &str,
    today: NaiveDate,
) -> Result<Vec<AnomalyCandidate>> {
    let series = reader.series(entity, metric, today, config.detection.window_days)?;
    if series.is_empty() {
        return Ok(Vec::new());
    }

    let detectors: [Box<dyn Detector>; 3] = [
        Box::new(StatisticalDetector),
        Box::new(OutlierDetector::mahalanobis()),
        Box::new(ForecastDetector),
    ];

    let mut candidates = Vec::new();
    for detector in &detectors {
        let mut found = detector.detect(&series, &config.detection);
        if !found.is_empty() {
            debug!(
                %entity,
                %metric,
                detector = %detector.kind(),
                count = found.len(),
                "candidates emitted"
            );
        }
        candidates.append(&mut found);
    }
    Ok(candidates)
}

/// Upsert fused anomalies and route them through rules, suppression, and
/// the queue. Returns (alerts created, jobs enqueued).
fn trigger_alerts(
    pool: &Pool,
    rule_engine: &RuleEngine,
    anomalies: Vec<crate::fusion::Anomaly>,
) -> Result<(usize, usize)> {
    let store = AnomalyStore::new(pool.clone());
    let alert_store = AlertStore::new(pool.clone());
    let suppressor = Suppressor::new(pool.clone());
    let queue = NotificationQueue::new(pool.clone());

    let mut alerts_created = 0;
    let mut jobs_enqueued = 0;

    for anomaly in anomalies {
        let merged = match store.upsert(&anomaly) {
            Ok(merged) => merged,
            Err(e) => {
                // Contained: an upsert race or I/O hiccup on one finding
                // must not abort the rest of the run
                warn!(id = %anomaly.id, error = %e, "anomaly upsert failed, skipping");
                continue;
            }
        };
        if merged.status == AnomalyStatus::Resolved {
            continue;
        }

        for alert in rule_engine.evaluate(&merged) {
            let Some(rule) = rule_engine.rule_set().get(&alert.rule_id) else {
                continue;
            };
            if let Err(e) = alert_store.insert(&alert) {
                warn!(alert = %alert.id, error = %e, "alert insert failed, skipping");
                continue;
            }
            alerts_created += 1;

            let outcome = match suppressor.admit(&alert, rule, Utc::now()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(alert = %alert.id, error = %e, "suppression admit failed, skipping");
                    continue;
                }
            };

            match outcome.admission {
                Admission::New => {
                    for channel in &rule.channels {
                        if queue
                            .enqueue(alert.id, *channel, alert.severity, &alert.payload())?
                            .is_some()
                        {
                            jobs_enqueued += 1;
                        }
                    }
                    store.set_status(merged.id, AnomalyStatus::Alerted)?;
                }
                Admission::Suppressed { count } => {
                    debug!(alert = %alert.id, count, "alert suppressed");
                    if merged.status == AnomalyStatus::New {
                        store.set_status(merged.id, AnomalyStatus::Suppressed)?;
                    }
                }
                Admission::Aggregated { pending } => {
                    debug!(alert = %alert.id, pending, "alert aggregated into digest");
                    if merged.status == AnomalyStatus::New {
                        store.set_status(merged.id, AnomalyStatus::Suppressed)?;
                    }
                }
            }

            if let Some(digest) = outcome.flushed {
                jobs_enqueued += enqueue_digest(&digest, rule, &alert_store, &queue)?;
            }
        }
    }

    Ok((alerts_created, jobs_enqueued))
}

/// One combined notification for a flushed digest window.
fn enqueue_digest(
    digest: &DigestDue,
    rule: &LoadedRule,
    alert_store: &AlertStore,
    queue: &NotificationQueue,
) -> Result<usize> {
    let severity = rule.severity_override.unwrap_or(rule.min_severity);
    let alert = Alert {
        id: uuid::Uuid::new_v4(),
        rule_id: rule.id.clone(),
        anomaly_id: None,
        entity: "digest".to_string(),
        metric: "digest".to_string(),
        severity,
        title: format!("{}: {} alerts in window", rule.name, digest.count),
        message: digest.summaries.join("\n"),
        snapshot: serde_json::json!({
            "count": digest.count,
            "summaries": digest.summaries,
            "window_start": digest.window_start.to_rfc3339(),
            "window_end": digest.window_end.to_rfc3339(),
        }),
        dedup_key: digest.dedup_key,
        created_at: Utc::now(),
    };
    alert_store.insert(&alert)?;

    let mut jobs = 0;
    for channel in &rule.channels {
        if queue
            .enqueue(alert.id, *channel, severity, &alert.payload())?
            .is_some()
        {
            jobs += 1;
        }
    }
    info!(rule = %rule.id, count = digest.count, "digest notification enqueued");
    Ok(jobs)
}

/// Cron-driven scan loop. Exits when `shutdown` flips.
pub async fn run_scan_loop(pipeline: Arc<Pipeline>, config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let schedule = match CronSchedule::from_str(&config.scan.cron) {
        Ok(s) => s,
        Err(e) => {
            error!(cron = %config.scan.cron, error = %e, "invalid scan cron expression, scan loop disabled");
            return;
        }
    };

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("scan schedule has no upcoming runs, scan loop stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        debug!(next = %next.to_rfc3339(), "next scan scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = pipeline.run_scan(Utc::now().date_naive(), &shutdown).await {
                    error!(error = %e, "scheduled scan failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Housekeeping tick: flush expired suppression windows into digests.
pub async fn run_flush_loop(pipeline: Arc<Pipeline>, config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let tick = std::time::Duration::from_secs(config.scan.flush_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                let p = Arc::clone(&pipeline);
                let flushed = tokio::task::spawn_blocking(move || p.flush_digests()).await;
                match flushed {
                    Ok(Ok(0)) | Err(_) => {}
                    Ok(Ok(n)) => info!(jobs = n, "digest windows flushed"),
                    Ok(Err(e)) => error!(error = %e, "digest flush failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
