use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use driftwatch::config::Config;

#[derive(Parser)]
#[command(
    name = "driftwatch",
    about = "Metric anomaly fusion and alert delivery for site performance monitoring",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file (falls back to DRIFTWATCH_CONFIG,
    /// /etc/driftwatch/driftwatch.toml, then compiled-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, default_value = "data/driftwatch.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scan loop + dispatcher)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run one detection scan immediately, then deliver runnable jobs
    Scan,

    /// Validate the configured alert rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Inspect or resolve anomalies
    Anomalies {
        #[command(subcommand)]
        action: AnomaliesAction,
    },

    /// Dead-lettered notification jobs
    Deadletter {
        #[command(subcommand)]
        action: DeadletterAction,
    },

    /// Load metric points from a JSON-lines file (one point per line)
    Ingest {
        /// Input file path
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Load the rule set and report what was accepted and rejected
    Validate,
}

#[derive(Subcommand)]
enum AnomaliesAction {
    /// List recent anomalies
    List {
        /// Filter by entity
        #[arg(long)]
        entity: Option<String>,

        /// Filter by status: new, suppressed, alerted, resolved
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Force-resolve one anomaly by id
    Resolve {
        /// Anomaly id
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum DeadletterAction {
    /// List dead-lettered jobs awaiting operator review
    List,

    /// Requeue one dead-lettered job with a fresh attempt budget
    Replay {
        /// Job id
        id: Uuid,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::load(p),
        None => Ok(Config::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "starting driftwatch daemon");
            driftwatch::serve(&bind, &cli.db, config).await?;
        }
        Commands::Scan => {
            use std::sync::Arc;

            config.severity.validate()?;
            let config = Arc::new(config);
            let pool = driftwatch::storage::open_pool(&cli.db)?;
            let registry =
                driftwatch::channel::ChannelRegistry::from_config(&config.channels);
            let rule_set =
                driftwatch::alert::rules::RuleSet::load(&config.rules, &registry);
            let rule_engine = Arc::new(driftwatch::alert::rules::RuleEngine::new(rule_set));
            let pipeline = driftwatch::pipeline::Pipeline::new(
                pool.clone(),
                Arc::clone(&config),
                rule_engine,
            );

            let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
            let summary = pipeline
                .run_scan(chrono::Utc::now().date_naive(), &cancel_rx)
                .await?;

            let queue = driftwatch::notify::NotificationQueue::new(pool);
            let dispatcher = driftwatch::notify::Dispatcher::new(
                queue,
                registry,
                config.delivery.clone(),
            );
            let delivered = dispatcher.drain_once().await?;

            println!("\n=== Driftwatch Scan ===");
            println!("Series scanned:      {}", summary.pairs);
            println!("Candidates:          {}", summary.candidates);
            println!("Canonical anomalies: {}", summary.anomalies);
            println!("Alerts fired:        {}", summary.alerts);
            println!("Jobs enqueued:       {}", summary.jobs);
            println!("Jobs processed:      {}", delivered);
            println!("Anomalies resolved:  {}", summary.resolved);
        }
        Commands::Rules { action } => match action {
            RulesAction::Validate => {
                let registry =
                    driftwatch::channel::ChannelRegistry::from_config(&config.channels);
                let rule_set =
                    driftwatch::alert::rules::RuleSet::load(&config.rules, &registry);

                if rule_set.rules.is_empty() && rule_set.rejected.is_empty() {
                    println!("No rules configured.");
                } else {
                    println!("{:<20} | {:<10} | {:<12} | Channels", "Rule", "Severity", "Aggregation");
                    println!("{:-<20}-|-{:-<10}-|-{:-<12}-|-{:-<20}", "", "", "", "");
                    for rule in &rule_set.rules {
                        let channels = rule
                            .channels
                            .iter()
                            .map(|c| c.as_str())
                            .collect::<Vec<_>>()
                            .join(",");
                        println!(
                            "{:<20} | {:<10} | {:<12} | {}",
                            rule.id,
                            rule.min_severity.as_str(),
                            rule.aggregation.as_str(),
                            channels
                        );
                    }
                    for rejected in &rule_set.rejected {
                        println!("REJECTED {:<11} : {}", rejected.id, rejected.reason);
                    }
                }
            }
        },
        Commands::Anomalies { action } => {
            let pool = driftwatch::storage::open_pool(&cli.db)?;
            let store = driftwatch::fusion::AnomalyStore::new(pool);

            match action {
                AnomaliesAction::List { entity, status, limit } => {
                    let status = status
                        .as_deref()
                        .map(|s| s.parse())
                        .transpose()
                        .map_err(|e: String| anyhow::anyhow!(e))?;
                    let anomalies = store.list(&driftwatch::fusion::store::AnomalyQuery {
                        entity,
                        status,
                        from: None,
                        to: None,
                        limit,
                    })?;

                    if anomalies.is_empty() {
                        println!("No anomalies found.");
                    } else {
                        println!(
                            "{:<36} | {:<10} | {:<8} | {:<6} | {:<10} | Entity/Metric",
                            "Id", "Day", "Severity", "Conf", "Status"
                        );
                        for a in anomalies {
                            println!(
                                "{:<36} | {:<10} | {:<8} | {:<6.2} | {:<10} | {} {}",
                                a.id,
                                a.day,
                                a.severity.as_str(),
                                a.confidence,
                                a.status.as_str(),
                                a.entity,
                                a.metric
                            );
                        }
                    }
                }
                AnomaliesAction::Resolve { id } => {
                    if store.force_resolve(id)? {
                        println!("Anomaly {id} resolved.");
                    } else {
                        println!("Anomaly {id} not found or already resolved.");
                    }
                }
            }
        }
        Commands::Deadletter { action } => {
            let pool = driftwatch::storage::open_pool(&cli.db)?;
            let queue = driftwatch::notify::NotificationQueue::new(pool);

            match action {
                DeadletterAction::List => {
                    let dead = queue.dead_letters()?;
                    if dead.is_empty() {
                        println!("No dead-lettered jobs.");
                    } else {
                        println!("{:<36} | {:<8} | {:<8} | Alert", "Job", "Channel", "Attempts");
                        for job in dead {
                            println!(
                                "{:<36} | {:<8} | {:<8} | {}",
                                job.id,
                                job.channel.as_str(),
                                job.attempts,
                                job.alert_id
                            );
                        }
                    }
                }
                DeadletterAction::Replay { id } => {
                    if queue.replay(id)? {
                        println!("Job {id} requeued for replay.");
                    } else {
                        println!("Job {id} not found or not dead-lettered.");
                    }
                }
            }
        }
        Commands::Ingest { file } => {
            let pool = driftwatch::storage::open_pool(&cli.db)?;
            let reader = std::io::BufReader::new(std::fs::File::open(&file)?);
            let count = driftwatch::metrics::ingest(&pool, reader)?;
            println!("Ingested {count} metric points from {}.", file.display());
        }
    }

    Ok(())
}
