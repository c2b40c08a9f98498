//! Worker pool that drains the notification queue.
//!
//! Workers are stateless between jobs. Every channel send runs under a
//! bounded timeout (a timeout counts as transient). Shutdown is observed
//! between jobs: an in-flight send always finishes its one attempt so the
//! delivery state stays unambiguous.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channel::{ChannelRegistry, SendOutcome};
use crate::config::DeliveryConfig;
use crate::notify::{JobStatus, NotificationJob, NotificationQueue};

pub struct Dispatcher {
    queue: NotificationQueue,
    registry: ChannelRegistry,
    delivery: DeliveryConfig,
}

impl Dispatcher {
    pub fn new(queue: NotificationQueue, registry: ChannelRegistry, delivery: DeliveryConfig) -> Self {
        Self {
            queue,
            registry,
            delivery,
        }
    }

    /// Spawn the worker pool. Workers exit when `shutdown` flips to true.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.delivery.workers.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    dispatcher.worker_loop(worker, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, "dispatcher worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.claim().await {
                Ok(Some(job)) => {
                    // A claimed job finishes its single attempt even if
                    // shutdown arrives mid-send
                    if let Err(e) = self.process(job).await {
                        error!(worker, error = %e, "failed to record job outcome");
                    }
                }
                Ok(None) => {
                    let idle = Duration::from_secs(self.delivery.poll_interval_secs.max(1));
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker, error = %e, "queue claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker, "dispatcher worker stopped");
    }

    async fn claim(&self) -> Result<Option<NotificationJob>> {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || queue.claim_next(Utc::now())).await?
    }

    /// Run one claimed job through its adapter and record the outcome.
    pub async fn process(&self, job: NotificationJob) -> Result<JobStatus> {
        let (outcome, error) = match self.registry.get(job.channel) {
            None => (
                // No destination configured for this channel: retrying
                // cannot help
                SendOutcome::PermanentFailure,
                Some(format!("channel '{}' not configured", job.channel)),
            ),
            Some(adapter) => {
                let timeout = Duration::from_secs(self.delivery.send_timeout_secs.max(1));
                match tokio::time::timeout(timeout, adapter.send(&job.payload)).await {
                    Ok(outcome) => {
                        let error = match &outcome {
                            SendOutcome::Success => None,
                            other => Some(format!("adapter reported {}", other.as_str())),
                        };
                        (outcome, error)
                    }
                    Err(_) => (
                        SendOutcome::TransientFailure,
                        Some(format!("send timed out after {}s", timeout.as_secs())),
                    ),
                }
            }
        };

        let queue = self.queue.clone();
        let delivery = self.delivery.clone();
        tokio::task::spawn_blocking(move || queue.complete_attempt(&job, outcome, error, &delivery))
            .await?
    }

    /// Process every runnable job right now. One-shot scans and tests use
    /// this instead of the worker pool.
    pub async fn drain_once(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.claim().await? {
            self.process(job).await?;
            processed += 1;
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelAdapter, ChannelKind};
    use crate::fusion::Severity;
    use crate::storage::open_test_pool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Adapter scripted to fail N times before succeeding.
    struct Flaky {
        kind: ChannelKind,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(kind: ChannelKind, failures: u32) -> Self {
            Self {
                kind,
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChannelAdapter for Flaky {
        fn kind(&self) -> ChannelKind {
            self.kind
        }
        async fn send(&self, _payload: &serde_json::Value) -> SendOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                SendOutcome::TransientFailure
            } else {
                SendOutcome::Success
            }
        }
    }

    fn delivery() -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: 5,
            backoff_base_secs: 0,
            jitter_frac: 0.0,
            send_timeout_secs: 2,
            ..DeliveryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_drain_delivers_queued_job() {
        let pool = open_test_pool().unwrap();
        let queue = NotificationQueue::new(pool);
        let adapter = Arc::new(Flaky::new(ChannelKind::Chat, 0));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            ChannelRegistry::with_adapters(vec![adapter.clone()]),
            delivery(),
        );

        let job_id = queue
            .enqueue(
                Uuid::new_v4(),
                ChannelKind::Chat,
                Severity::High,
                &serde_json::json!({"title": "t"}),
            )
            .unwrap()
            .unwrap();

        let processed = dispatcher.drain_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get(job_id).unwrap().unwrap().status, JobStatus::Delivered);
    }

    #[tokio::test]
    async fn test_transient_failures_eventually_deliver() {
        let pool = open_test_pool().unwrap();
        let queue = NotificationQueue::new(pool);
        let adapter = Arc::new(Flaky::new(ChannelKind::Chat, 2));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            ChannelRegistry::with_adapters(vec![adapter.clone()]),
            delivery(),
        );

        let job_id = queue
            .enqueue(
                Uuid::new_v4(),
                ChannelKind::Chat,
                Severity::Medium,
                &serde_json::json!({"title": "t"}),
            )
            .unwrap()
            .unwrap();

        // Zero backoff base keeps retries runnable immediately
        for _ in 0..3 {
            dispatcher.drain_once().await.unwrap();
        }

        let job = queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delivered);
        assert_eq!(job.attempts, 3);
        assert_eq!(queue.attempts(job_id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unconfigured_channel_dead_letters() {
        let pool = open_test_pool().unwrap();
        let queue = NotificationQueue::new(pool);
        let dispatcher = Dispatcher::new(
            queue.clone(),
            ChannelRegistry::with_adapters(vec![]),
            delivery(),
        );

        let job_id = queue
            .enqueue(
                Uuid::new_v4(),
                ChannelKind::Webhook,
                Severity::Low,
                &serde_json::json!({"title": "t"}),
            )
            .unwrap()
            .unwrap();

        dispatcher.drain_once().await.unwrap();
        let job = queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
    }

    /// Adapter that never answers inside the timeout.
    struct Hung;

    #[async_trait::async_trait]
    impl ChannelAdapter for Hung {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Chat
        }
        async fn send(&self, _payload: &serde_json::Value) -> SendOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            SendOutcome::Success
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let pool = open_test_pool().unwrap();
        let queue = NotificationQueue::new(pool);
        let dispatcher = Dispatcher::new(
            queue.clone(),
            ChannelRegistry::with_adapters(vec![Arc::new(Hung)]),
            DeliveryConfig {
                // Real backoff so the drain stops after the first attempt
                backoff_base_secs: 30,
                ..delivery()
            },
        );

        let job_id = queue
            .enqueue(
                Uuid::new_v4(),
                ChannelKind::Chat,
                Severity::Low,
                &serde_json::json!({"title": "t"}),
            )
            .unwrap()
            .unwrap();

        dispatcher.drain_once().await.unwrap();
        let job = queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let attempts = queue.attempts(job_id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, SendOutcome::TransientFailure);
        assert!(attempts[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let pool = open_test_pool().unwrap();
        let queue = NotificationQueue::new(pool);
        let dispatcher = Arc::new(Dispatcher::new(
            queue,
            ChannelRegistry::with_adapters(vec![]),
            DeliveryConfig {
                workers: 2,
                poll_interval_secs: 1,
                ..delivery()
            },
        ));

        let (tx, rx) = watch::channel(false);
        let handles = dispatcher.spawn_workers(rx);
        tx.send(true).unwrap();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }
}
