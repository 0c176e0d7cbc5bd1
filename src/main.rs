//! partkeeper
//!
//! Keeps the partitions of PostgreSQL tables in line with their partitioning
//! strategies: creates upcoming partitions, detaches expired ones and drops
//! detached partitions once their retention passed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use common::database::{Connection, PgDatabase};
use common::lease::PgLeaseService;
use common::time::{SystemProvider, TimeProvider};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use partitioning::{
    ManagerSettings, MultiDatabasePartitioning, PartitionMonitoring, PartitionedTableRegistry,
    SyncOutcome, TableSync,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "PostgreSQL partition maintenance", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run sync, drop and monitoring loops until interrupted (default)
    Run,
    /// Sync the partitions of every table once
    Sync {
        #[arg(long, help = "Only sync on this database")]
        only_on: Option<String>,
        #[arg(long, help = "Skip ANALYZE of partitioned tables")]
        no_analyze: bool,
    },
    /// Drop detached partitions whose retention passed
    DropDetached,
    /// Report partition counts of every table
    Report {
        #[arg(long, help = "Show counts in JSON format")]
        json: bool,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

struct Maintenance {
    partitioning: MultiDatabasePartitioning,
    monitoring: PartitionMonitoring,
    meter_provider: SdkMeterProvider,
}

impl Maintenance {
    async fn connect(config: &Configuration, time_provider: Arc<dyn TimeProvider>) -> Result<Self> {
        let mut connections: Vec<Arc<dyn Connection>> = Vec::with_capacity(config.databases.len());
        let mut main_pool = None;
        for database in &config.databases {
            let db = PgDatabase::connect(database)
                .await
                .with_context(|| format!("Failed to connect to database {}", database.name))?;
            if main_pool.is_none() {
                main_pool = Some(db.primary_pool().clone());
            }
            connections.push(Arc::new(db));
        }

        // Leases live on the main database
        let main_pool = main_pool.context("No database configured")?;
        let leases = PgLeaseService::new(main_pool)
            .await
            .context("Failed to initialize exclusive leases")?;

        let registry = PartitionedTableRegistry::from_config(config, time_provider.clone())
            .context("Failed to build partitioned table registry")?;
        info!(tables = registry.len(), "Registered partitioned tables");

        let meter_provider = SdkMeterProvider::builder().build();
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let monitoring = PartitionMonitoring::new(&opentelemetry::global::meter("partkeeper"));

        Ok(Self {
            partitioning: MultiDatabasePartitioning::new(
                registry,
                connections,
                Arc::new(leases),
                time_provider,
                ManagerSettings::from_config(&config.partitioning),
            ),
            monitoring,
            meter_provider,
        })
    }

    async fn sync(&self, analyze: bool, only_on: Option<&str>) -> Result<()> {
        let results = self
            .partitioning
            .sync_partitions(analyze, only_on)
            .await
            .context("Partition sync failed")?;
        for result in &results {
            log_sync(result);
        }
        Ok(())
    }

    async fn drop_detached(&self) {
        for (connection_name, summary) in self.partitioning.drop_detached_partitions().await {
            info!(
                connection_name = %connection_name,
                dropped = summary.dropped.len(),
                discarded = summary.discarded.len(),
                skipped = summary.skipped.len(),
                failed = summary.failed.len(),
                "Dropped detached partitions"
            );
        }
    }

    async fn report(&self, json: bool) -> Result<()> {
        let reported = self.partitioning.report_metrics(&self.monitoring).await;
        if json {
            let tables: Vec<_> = reported
                .iter()
                .map(|(table, counts)| {
                    serde_json::json!({
                        "table": table,
                        "present": counts.present,
                        "missing": counts.missing,
                        "extra": counts.extra,
                    })
                })
                .collect();
            let json = serde_json::to_string_pretty(&tables)
                .context("Failed to serialize partition counts to JSON")?;
            println!("{json}");
        } else {
            for (table, counts) in &reported {
                println!(
                    "{table}: {} present, {} missing, {} extra",
                    counts.present, counts.missing, counts.extra
                );
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(e) = self.meter_provider.shutdown() {
            warn!(error = %e, "Failed to shut down meter provider");
        }
    }
}

fn log_sync(result: &TableSync) {
    match &result.outcome {
        SyncOutcome::Synced {
            created,
            detached,
            analyzed,
        } => info!(
            table_name = %result.table_name,
            connection_name = %result.connection_name,
            created = created.len(),
            detached = detached.len(),
            analyzed = *analyzed,
            "Synced partitions"
        ),
        SyncOutcome::Failed(reason) => warn!(
            table_name = %result.table_name,
            connection_name = %result.connection_name,
            reason = %reason,
            "Partition sync did not complete"
        ),
        outcome => debug!(
            table_name = %result.table_name,
            connection_name = %result.connection_name,
            outcome = ?outcome,
            "Skipped partition sync"
        ),
    }
}

/// Run `cycle` every `period`, starting immediately.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    maintenance: Arc<Maintenance>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Maintenance>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!(task = name, "Running maintenance cycle");
            cycle(maintenance.clone()).await;
        }
    })
}

async fn run(maintenance: Arc<Maintenance>, config: &Configuration) -> Result<()> {
    let settings = &config.partitioning;
    if !settings.enabled {
        info!("Partition maintenance is disabled in configuration (partitioning.enabled = false)");
        return Ok(());
    }

    info!(
        sync_interval = ?settings.sync_interval,
        drop_interval = ?settings.drop_interval,
        monitoring_interval = ?settings.monitoring_interval,
        "Starting partition maintenance"
    );

    let analyze = settings.analyze;
    let tasks = [
        spawn_loop("sync", settings.sync_interval, maintenance.clone(), move |m| async move {
            if let Err(e) = m.sync(analyze, None).await {
                error!(error = ?e, "Partition sync cycle failed");
            }
        }),
        spawn_loop("drop", settings.drop_interval, maintenance.clone(), |m| async move {
            m.drop_detached().await;
        }),
        spawn_loop(
            "monitoring",
            settings.monitoring_interval,
            maintenance.clone(),
            |m| async move {
                m.partitioning.report_metrics(&m.monitoring).await;
            },
        ),
    ];

    info!("partkeeper running, waiting for shutdown signal");
    wait_for_shutdown_signal().await?;

    info!("Received shutdown signal, stopping partition maintenance");
    for task in &tasks {
        task.abort();
    }

    info!("partkeeper stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = utils::load_config(cli.common.config.as_ref())?;
    utils::init_logging(&cli.common, &config.logging);

    let command = cli.command.unwrap_or(Command::Run);
    if let Command::Common(common) = &command {
        return utils::handle_common_command(common, &config);
    }
    config.validate().context("Invalid configuration")?;

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let maintenance = Arc::new(Maintenance::connect(&config, time_provider).await?);

    let result = match command {
        Command::Run => run(maintenance.clone(), &config).await,
        Command::Sync {
            only_on,
            no_analyze,
        } => {
            maintenance
                .sync(config.partitioning.analyze && !no_analyze, only_on.as_deref())
                .await
        }
        Command::DropDetached => {
            maintenance.drop_detached().await;
            Ok(())
        }
        Command::Report { json } => maintenance.report(json).await,
        Command::Common(_) => Ok(()),
    };

    maintenance.shutdown();
    result
}
