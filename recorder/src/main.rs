mod aggregator;
mod config;
mod entity;
mod error;
mod ledger;
mod node;
mod notifier;
mod poller;
mod recorder;
mod schema;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::RecorderConfig;
use ledger::UsageLedger;
use mimalloc::MiMalloc;
use node::{HttpClient, HttpNode, NodeRegistry, UsageNode, http_client};
use notifier::{NoopNotifier, ThresholdNotifier, UsageAlert, UsageNotifier};
use recorder::{CycleReport, UsageRecorder};
use sea_orm::DatabaseConnection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "usage-recorder")]
#[command(about = "Records node traffic into hourly per-user and per-node usage ledgers", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "recorder.toml")]
    config: String,

    /// Database URL, overrides the config file
    #[arg(long, env = "RECORDER_DATABASE_URL")]
    database_url: Option<String>,

    /// Seconds between recording cycles
    #[arg(long, env = "RECORDER_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = if Path::new(&args.config).exists() {
        RecorderConfig::load(&args.config)
            .with_context(|| format!("Failed to load config file: {}", args.config))?
    } else {
        RecorderConfig::default()
    };
    if let Some(database_url) = args.database_url {
        cfg.database_url = database_url;
    }
    if let Some(interval_secs) = args.interval_secs {
        cfg.record_interval_secs = interval_secs;
    }
    cfg.validate()?;

    let _guard = telemetry::init_tracing(
        cfg.log_dir.as_deref(),
        &cfg.log_file,
        &cfg.log_level,
        cfg.console_port,
    );
    info!("Starting usage recorder with configuration: {:?}", cfg);

    let db = schema::connect(&cfg.database_url)
        .await
        .context("Failed to open usage database")?;

    let notifier: Arc<dyn UsageNotifier> = if cfg.usage_thresholds.is_empty() {
        Arc::new(NoopNotifier)
    } else {
        let (alert_tx, mut alert_rx) = tokio::sync::mpsc::unbounded_channel::<UsageAlert>();
        tokio::spawn(async move {
            while let Some(alert) = alert_rx.recv().await {
                warn!(
                    user_id = alert.user_id,
                    threshold = alert.threshold,
                    "User {} reached {}% of data limit ({} / {} bytes)",
                    alert.username,
                    alert.threshold,
                    alert.used_traffic,
                    alert.data_limit
                );
            }
        });
        let notifier = ThresholdNotifier::new(cfg.usage_thresholds.clone()).with_sender(alert_tx);
        info!("Usage alerts enabled at {:?} percent", notifier.thresholds());
        Arc::new(notifier)
    };

    let recorder = UsageRecorder::new(
        NodeRegistry::new(),
        UsageLedger::new(db.clone()),
        notifier,
    )
    .with_node_timeout(cfg.node_timeout());
    let client = http_client();

    if args.once {
        let report = run_cycle(&db, &recorder, &client, &cfg.node_stats_path).await?;
        info!("Single cycle finished: {:?}", report);
        return Ok(());
    }

    let (db, recorder, client) = (&db, &recorder, &client);
    let stats_path = cfg.node_stats_path.as_str();
    run_scheduled(
        cfg.record_interval(),
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
        move || run_cycle(db, recorder, client, stats_path),
    )
    .await;

    info!("Shutting down usage recorder");
    Ok(())
}

/// Runs `cycle` on every tick until `shutdown` resolves. A shutdown that
/// arrives mid-cycle takes effect once that cycle returns.
async fn run_scheduled<S, C, F>(period: Duration, shutdown: S, mut cycle: C)
where
    S: Future<Output = ()>,
    C: FnMut() -> F,
    F: Future<Output = error::Result<CycleReport>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = cycle().await {
                    error!("Recording cycle failed: {}", e);
                }
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }
}

/// Refreshes the registry from the nodes table, then records one cycle.
async fn run_cycle(
    db: &DatabaseConnection,
    recorder: &UsageRecorder,
    client: &HttpClient,
    stats_path: &str,
) -> error::Result<CycleReport> {
    let nodes = node::load_nodes(db).await?;
    recorder.registry().sync(&nodes, |row| {
        let node = HttpNode::from_model(row, client.clone(), stats_path)?;
        Ok(Arc::new(node) as Arc<dyn UsageNode>)
    });
    recorder.record_user_usages().await
}
