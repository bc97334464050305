use anyhow::Result;
use qwatch_alert::{EventBus, LeaderLock, RuleManager};
use qwatch_common::types::now_millis;
use qwatch_notify::manager::NotificationManager;
use qwatch_notify::plugin::ChannelRegistry;
use qwatch_notify::NotificationDispatcher;
use qwatch_storage::SqliteAlertStore;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use qwatch_server::config::ServerConfig;
use qwatch_server::ingest;
use qwatch_server::rule_seed::{self, RulesSeedFile};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  qwatch-server [config.toml]                          Start the server, reading samples from stdin");
    eprintln!("  qwatch-server init-rules <config.toml> <rules.json>  Create or update rules from a seed file");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("qwatch=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-rules") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <config.toml> and <rules.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <rules.json> argument")
            })?;
            run_init_rules(config_path, seed_path).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

fn build_manager(
    config: &ServerConfig,
    dispatcher: Arc<dyn NotificationDispatcher>,
) -> Result<RuleManager> {
    qwatch_common::id::init(1, config.node_id);
    let store = SqliteAlertStore::open(config.database_path())?;
    let manager = RuleManager::new(
        config.host_id.clone(),
        Arc::new(store),
        dispatcher,
        EventBus::default(),
        LeaderLock::new(config.has_lock),
    )
    .with_history_retention(config.history_retention_ms);
    for metric in &config.metrics {
        manager.register_metric(&metric.id, metric.aggregator.clone());
    }
    Ok(manager)
}

async fn run_init_rules(config_path: &str, seed_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let seed = RulesSeedFile::load(seed_path)?;
    // Seeding never notifies.
    let manager = build_manager(&config, Arc::new(NotificationManager::new()))?;
    let summary = rule_seed::seed_rules(&manager, seed).await?;
    manager.shutdown();
    if summary.failed > 0 {
        anyhow::bail!("{} seeded rule(s) failed validation", summary.failed);
    }
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;

    tracing::info!(
        host_id = %config.host_id,
        db = %config.database_path().display(),
        has_lock = config.has_lock,
        channels = config.channels.len(),
        metrics = config.metrics.len(),
        "qwatch-server starting"
    );

    let notifier = NotificationManager::from_configs(&ChannelRegistry::default(), &config.channels)?;
    let manager = Arc::new(build_manager(&config, Arc::new(notifier))?);
    manager.load_rules().await?;

    // Event log
    let mut events = manager.bus().subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(event = event.name(), rule_id = %event.rule_id(), "rule event")
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagged behind the bus")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Periodic snapshot evaluation
    let snapshot_manager = manager.clone();
    let snapshot_interval = Duration::from_millis(config.snapshot_interval_ms);
    let snapshot_handle = tokio::spawn(async move {
        let mut tick = interval(snapshot_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let snapshot = snapshot_manager.snapshot(now_millis());
            let summary = snapshot_manager.process_snapshot(&snapshot).await;
            if summary.opened > 0 || summary.closed > 0 || summary.removed > 0 {
                tracing::info!(
                    evaluated = summary.evaluated,
                    opened = summary.opened,
                    closed = summary.closed,
                    removed = summary.removed,
                    "Snapshot processed"
                );
            }
            if summary.failed > 0 {
                tracing::warn!(failed = summary.failed, "Some rules failed to evaluate, retrying next tick");
            }
        }
    });

    // Periodic cleanup task
    let cleanup_manager = manager.clone();
    let retention_ms = config.retention_ms();
    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs);
    let cleanup_handle = tokio::spawn(async move {
        let mut tick = interval(cleanup_interval);
        loop {
            tick.tick().await;
            if let Err(e) = cleanup_manager.prune_alerts(retention_ms, now_millis()).await {
                tracing::error!(error = %e, "Alert cleanup failed");
            }
        }
    });

    // Sample ingestion from stdin
    let ingest_manager = manager.clone();
    let ingest_handle = tokio::spawn(async move {
        let reader = BufReader::new(tokio::io::stdin());
        match ingest::run_ingest(reader, &ingest_manager).await {
            Ok(stats) => tracing::info!(
                accepted = stats.accepted,
                unknown_metric = stats.unknown_metric,
                malformed = stats.malformed,
                "Sample input closed"
            ),
            Err(e) => tracing::error!(error = %e, "Sample input failed"),
        }
    });

    tracing::info!("qwatch-server running");

    signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    snapshot_handle.abort();
    cleanup_handle.abort();
    ingest_handle.abort();
    manager.shutdown();
    events_handle.abort();

    Ok(())
}
