//! txflow CLI: run the coordinator, worker, or completer against Postgres.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use txflow::backend::WorkStore;
use txflow::config::Config;
use txflow::db::Db;
use txflow::engine::{Coordinator, SimulatedTask, Worker};
use txflow::model::{Status, WorkId};
use txflow::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};

#[derive(Parser)]
#[command(name = "txflow", about = "Transactional request/reply work coordination")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create pending work items
    Seed {
        /// Work item IDs
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Dispatch work items (coordinator)
    Start {
        /// Work item IDs
        #[arg(required = true)]
        ids: Vec<i64>,
        /// Keep running the completer loop afterwards
        #[arg(long)]
        complete: bool,
    },
    /// Process work requests until Ctrl-C
    Worker,
    /// Apply work replies until Ctrl-C
    Completer,
    /// Show a work item
    Show {
        /// Work item ID
        id: i64,
    },
    /// List work items
    List {
        /// Filter by status (Pending, InProgress, Completed, Failed)
        #[arg(long)]
        status: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Seed { ids } => {
            let db = connect(&config).await?;
            for id in ids {
                let created = db.create_work_item(WorkId(id)).await?;
                println!(
                    "{id}: {}",
                    if created { "created" } else { "already exists" }
                );
            }
            Ok(())
        }
        Command::Start { ids, complete } => cmd_start(&config, ids, complete).await,
        Command::Worker => cmd_worker(&config).await,
        Command::Completer => cmd_completer(&config).await,
        Command::Show { id } => {
            let db = connect(&config).await?;
            let item = db.get_work_item(WorkId(id)).await?;
            println!("ID:         {}", item.id);
            println!("Status:     {}", item.status);
            println!("Started:    {}", display_time(item.started_at));
            println!("Completed:  {}", display_time(item.completed_at));
            println!("Result:     {}", item.result.as_deref().unwrap_or("-"));
            Ok(())
        }
        Command::List { status, limit } => {
            let status: Option<Status> = match status {
                Some(s) => Some(s.parse().map_err(|_| anyhow::anyhow!("invalid status: {s}"))?),
                None => None,
            };
            let db = connect(&config).await?;
            let items = db.list_work_items(status, limit).await?;
            if items.is_empty() {
                println!("No work items found.");
                return Ok(());
            }

            println!("{:<10}  {:<10}  {:<20}  RESULT", "ID", "STATUS", "COMPLETED");
            println!("{}", "-".repeat(72));
            for item in &items {
                println!(
                    "{:<10}  {:<10}  {:<20}  {}",
                    item.id,
                    item.status,
                    display_time(item.completed_at),
                    item.result.as_deref().unwrap_or("-")
                );
            }
            println!("\n{} item(s)", items.len());
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret(), config.max_connections).await?;
    db.migrate().await?;
    Ok(db)
}

fn telemetry(config: &Config, service: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service.to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

fn display_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn cmd_start(config: &Config, ids: Vec<i64>, complete: bool) -> anyhow::Result<()> {
    let _guard = telemetry(config, "txflow-coordinator")?;
    let db = Arc::new(connect(config).await?);

    let coordinator = Coordinator::new(db, config.protocol.clone());
    coordinator.declare_queues().await?;

    let ids: Vec<WorkId> = ids.into_iter().map(WorkId).collect();
    let failed = coordinator.start_all(&ids).await;

    if complete {
        let completer = coordinator.completer();
        let ctrl = completer.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            ctrl.shutdown();
        });
        completer.run().await?;
    }

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("failed to dispatch {} work item(s): {failed:?}", failed.len())
    }
}

async fn cmd_worker(config: &Config) -> anyhow::Result<()> {
    let _guard = telemetry(config, "txflow-worker")?;
    let db = Arc::new(connect(config).await?);

    let worker = Worker::new(
        db,
        SimulatedTask::new(config.protocol.task_latency),
        &config.protocol,
    );
    let ctrl = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_completer(config: &Config) -> anyhow::Result<()> {
    let _guard = telemetry(config, "txflow-completer")?;
    let db = Arc::new(connect(config).await?);

    let coordinator = Coordinator::new(db, config.protocol.clone());
    coordinator.declare_queues().await?;
    let completer = coordinator.completer();
    let ctrl = completer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    completer.run().await?;
    Ok(())
}
