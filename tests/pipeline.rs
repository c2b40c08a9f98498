//! End-to-end pipeline tests: seeded metrics through detection, fusion,
//! rules, suppression, and delivery against a scripted channel adapter.

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use driftwatch::alert::rules::{RuleEngine, RuleSet};
use driftwatch::channel::{ChannelAdapter, ChannelKind, ChannelRegistry, SendOutcome};
use driftwatch::config::{Config, RuleConfig};
use driftwatch::fusion::store::AnomalyQuery;
use driftwatch::fusion::AnomalyStore;
use driftwatch::metrics::{record_point, MetricPoint};
use driftwatch::notify::{Dispatcher, JobStatus, NotificationQueue};
use driftwatch::pipeline::Pipeline;
use driftwatch::storage::{open_pool, Pool};

/// Adapter that records every payload and answers from a script.
struct Scripted {
    kind: ChannelKind,
    outcomes: Mutex<Vec<SendOutcome>>,
    sent: Mutex<Vec<serde_json::Value>>,
}

impl Scripted {
    fn succeeding(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            outcomes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn failing(kind: ChannelKind, outcomes: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            outcomes: Mutex::new(outcomes),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for Scripted {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, payload: &serde_json::Value) -> SendOutcome {
        self.sent.lock().unwrap().push(payload.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(SendOutcome::Success)
    }
}

fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// 29 stable days (mean 100, sigma ~10) then a 135 spike on the last day.
fn seed_spike_series(pool: &Pool, entity: &str, metric: &str, last_day: NaiveDate) {
    for i in 0..30 {
        let value = if i == 29 {
            135.0
        } else if i % 2 == 0 {
            90.0
        } else {
            110.0
        };
        record_point(
            pool,
            &MetricPoint {
                entity: entity.to_string(),
                metric: metric.to_string(),
                day: last_day - chrono::Duration::days(29 - i),
                value,
            },
        )
        .unwrap();
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.delivery.max_attempts = 3;
    config.delivery.backoff_base_secs = 0;
    config.delivery.jitter_frac = 0.0;
    config.rules = vec![RuleConfig {
        id: "clicks-anomaly".into(),
        name: "Search clicks anomaly".into(),
        entity_prefix: "page:".into(),
        metrics: vec!["search.clicks".into()],
        min_severity: "low".into(),
        min_confidence: 0.0,
        min_magnitude_pct: 0.0,
        severity_override: None,
        channels: vec!["chat".into()],
        suppression_window_secs: 86_400,
        aggregation: "none".into(),
        burst_threshold: 10,
    }];
    config
}

struct Harness {
    pool: Pool,
    pipeline: Pipeline,
    dispatcher: Dispatcher,
    adapter: Arc<Scripted>,
    _dir: tempfile::TempDir,
}

fn harness(adapter: Arc<Scripted>) -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("driftwatch.db");
    let pool = open_pool(db_path.to_str().unwrap()).unwrap();

    let config = Arc::new(test_config());
    let registry = ChannelRegistry::with_adapters(vec![adapter.clone() as Arc<dyn ChannelAdapter>]);
    let rule_set = RuleSet::load(&config.rules, &registry);
    assert!(rule_set.rejected.is_empty(), "{:?}", rule_set.rejected);
    let rule_engine = Arc::new(RuleEngine::new(rule_set));

    let pipeline = Pipeline::new(pool.clone(), Arc::clone(&config), rule_engine);
    let dispatcher = Dispatcher::new(
        NotificationQueue::new(pool.clone()),
        registry,
        config.delivery.clone(),
    );

    Harness {
        pool,
        pipeline,
        dispatcher,
        adapter,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_spike_flows_from_metrics_to_delivered_notification() {
    let h = harness(Scripted::succeeding(ChannelKind::Chat));
    let today = day("2026-07-30");
    seed_spike_series(&h.pool, "page:/pricing", "search.clicks", today);

    let (_tx, cancel) = tokio::sync::watch::channel(false);
    let summary = h.pipeline.run_scan(today, &cancel).await.unwrap();

    assert!(summary.anomalies >= 1, "no anomalies found: {summary:?}");
    assert!(summary.alerts >= 1);
    assert!(summary.jobs >= 1);

    // The spike day surfaced as an "above" anomaly
    let store = AnomalyStore::new(h.pool.clone());
    let anomalies = store.list(&AnomalyQuery::default()).unwrap();
    assert!(anomalies
        .iter()
        .any(|a| a.day == today && a.entity == "page:/pricing"));

    // Delivery
    let processed = h.dispatcher.drain_once().await.unwrap();
    assert_eq!(processed, summary.jobs);
    assert!(h.adapter.sent_count() >= 1);

    // Every enqueued job reached a terminal state
    let queue = NotificationQueue::new(h.pool.clone());
    for job in queue.dead_letters().unwrap() {
        panic!("unexpected dead letter: {:?}", job.id);
    }
}

#[tokio::test]
async fn test_rescan_is_idempotent_and_suppressed() {
    let h = harness(Scripted::succeeding(ChannelKind::Chat));
    let today = day("2026-07-30");
    seed_spike_series(&h.pool, "page:/pricing", "search.clicks", today);

    let (_tx, cancel) = tokio::sync::watch::channel(false);
    let first = h.pipeline.run_scan(today, &cancel).await.unwrap();
    assert!(first.jobs >= 1);

    let store = AnomalyStore::new(h.pool.clone());
    let after_first = store.list(&AnomalyQuery::default()).unwrap();

    // Second scan over identical data: same anomaly rows, no new jobs
    let second = h.pipeline.run_scan(today, &cancel).await.unwrap();
    let after_second = store.list(&AnomalyQuery::default()).unwrap();

    assert_eq!(after_first.len(), after_second.len());
    for (a, b) in after_first.iter().zip(after_second.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.confidence, b.confidence);
    }
    assert_eq!(second.jobs, 0, "suppression should stop repeat jobs");
}

#[tokio::test]
async fn test_always_transient_channel_dead_letters_with_full_audit_trail() {
    let h = harness(Scripted::failing(
        ChannelKind::Chat,
        vec![SendOutcome::TransientFailure; 100],
    ));
    let today = day("2026-07-30");
    seed_spike_series(&h.pool, "page:/pricing", "search.clicks", today);

    let (_tx, cancel) = tokio::sync::watch::channel(false);
    let summary = h.pipeline.run_scan(today, &cancel).await.unwrap();
    assert!(summary.jobs >= 1);

    // Zero backoff: drain retries until every job is dead
    h.dispatcher.drain_once().await.unwrap();

    let queue = NotificationQueue::new(h.pool.clone());
    let dead = queue.dead_letters().unwrap();
    assert_eq!(dead.len(), summary.jobs);

    for job in &dead {
        // Retried exactly max_attempts times, each attempt on record
        assert_eq!(job.attempts, 3);
        let attempts = queue.attempts(job.id).unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .all(|a| a.outcome == SendOutcome::TransientFailure));
    }

    // Operator replay puts the job back through the pipe; channel now works
    *h.adapter.outcomes.lock().unwrap() = Vec::new();
    assert!(queue.replay(dead[0].id).unwrap());
    h.dispatcher.drain_once().await.unwrap();
    assert_eq!(
        queue.get(dead[0].id).unwrap().unwrap().status,
        JobStatus::Delivered
    );
}

#[tokio::test]
async fn test_cancelled_scan_stops_between_stages() {
    let h = harness(Scripted::succeeding(ChannelKind::Chat));
    let today = day("2026-07-30");
    seed_spike_series(&h.pool, "page:/pricing", "search.clicks", today);

    let (tx, cancel) = tokio::sync::watch::channel(true);
    let summary = h.pipeline.run_scan(today, &cancel).await.unwrap();
    drop(tx);

    assert!(summary.cancelled);
    assert_eq!(summary.jobs, 0);

    let store = AnomalyStore::new(h.pool.clone());
    assert!(store.list(&AnomalyQuery::default()).unwrap().is_empty());
}

#[tokio::test]
async fn test_unscoped_entities_stay_quiet() {
    let h = harness(Scripted::succeeding(ChannelKind::Chat));
    let today = day("2026-07-30");
    // Rule scope is "page:"; keyword entities anomalies fire no alerts
    seed_spike_series(&h.pool, "kw:rust monitoring", "search.clicks", today);

    let (_tx, cancel) = tokio::sync::watch::channel(false);
    let summary = h.pipeline.run_scan(today, &cancel).await.unwrap();

    assert!(summary.anomalies >= 1);
    assert_eq!(summary.alerts, 0);
    assert_eq!(summary.jobs, 0);
    assert_eq!(h.adapter.sent_count(), 0);
}
