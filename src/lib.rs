//! driftwatch -- metric anomaly fusion and alert delivery.
//!
//! This crate watches per-entity performance metrics (search clicks,
//! keyword rank, load-quality scores), scores them with three independent
//! detectors, fuses the signals into canonical anomalies, and turns
//! qualifying findings into notifications with suppression and durable
//! retry.

pub mod alert;
pub mod api;
pub mod channel;
pub mod config;
pub mod detect;
pub mod fusion;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::alert::rules::{RuleEngine, RuleSet};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::notify::{Dispatcher, NotificationQueue};
use crate::pipeline::Pipeline;

/// Start the driftwatch daemon: API server, scan loop, digest flusher, and
/// dispatcher worker pool.
pub async fn serve(bind: &str, db_path: &str, config: Config) -> Result<()> {
    // Fatal config problems stop the process here; bad rules merely get
    // excluded at load
    config.severity.validate()?;
    let config = Arc::new(config);

    // 1. Storage
    tracing::info!(%db_path, "initializing database");
    let pool = storage::open_pool(db_path)?;

    // 2. Channels and rules
    let registry = ChannelRegistry::from_config(&config.channels);
    let rule_set = RuleSet::load(&config.rules, &registry);
    let rule_engine = Arc::new(RuleEngine::new(rule_set));
    let pipeline = Arc::new(Pipeline::new(pool.clone(), Arc::clone(&config), rule_engine));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 3. Dispatcher worker pool
    let queue = NotificationQueue::new(pool.clone());
    let dispatcher = Arc::new(Dispatcher::new(queue, registry, config.delivery.clone()));
    let worker_handles = dispatcher.spawn_workers(shutdown_rx.clone());

    // 4. Background loops: cron-driven scans, digest window flushing
    tokio::spawn(pipeline::run_scan_loop(
        Arc::clone(&pipeline),
        Arc::clone(&config),
        shutdown_rx.clone(),
    ));
    tokio::spawn(pipeline::run_flush_loop(
        Arc::clone(&pipeline),
        Arc::clone(&config),
        shutdown_rx.clone(),
    ));

    // 5. API server
    let state = api::state::AppState {
        pool,
        pipeline,
        cancel: shutdown_rx,
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = bind.parse().context("invalid bind address")?;
    tracing::info!(%addr, "driftwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Let in-flight sends finish their single attempt, then stop
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    Ok(())
}
