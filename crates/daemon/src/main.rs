//! flightwork-daemon: drains one work queue through its stored procedure.
//!
//! One process per queue; several can share a database and even a queue.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use flightwork_core::{Tier, WorkItemId};
use flightwork_infra::config::{DATABASE_URL_ENV, DaemonSettings, ResolvedConfig};
use flightwork_infra::daemons::{QueueKind, StoredProcedureDelegate};
use flightwork_infra::queue::{self, PostgresWorkQueueStore, WorkQueueStore};
use flightwork_infra::scheduler::{
    BatchRunner, DaemonController, SchedulerError, install_signal_handlers,
};

#[derive(Parser, Debug)]
#[command(name = "flightwork-daemon")]
#[command(version, about = "Batch work-queue daemon for flight tracking", long_about = None)]
struct Cli {
    /// Queue to serve (route-parse, boundary, waypoint-eta, delivery)
    #[arg(short, long)]
    queue: QueueKind,

    /// TOML config file; presets apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured batch size
    #[arg(long)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single cycle over every tier and exit
    RunOnce,

    /// Cycle until SIGTERM/SIGINT
    RunLoop {
        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,

        /// Seconds to wait before the first cycle
        #[arg(long)]
        stagger: Option<u64>,
    },

    /// Run a single cycle restricted to one tier
    RunTier {
        tier: u8,
    },

    /// Inspect and resolve items that exhausted their retries
    #[command(subcommand)]
    DeadLetters(DeadLetterCommands),
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommands {
    /// Print failed items as JSON lines
    List {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Put a failed item back into the queue with a fresh retry budget
    Requeue { id: WorkItemId },
    /// Delete a failed item
    Discard { id: WorkItemId },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };

    flightwork_observability::init(config.log_format);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "daemon exiting");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<ResolvedConfig> {
    let settings = match &cli.config {
        Some(path) => DaemonSettings::load(path)?,
        None => DaemonSettings::default(),
    };
    let mut config = settings.resolve(cli.queue, std::env::var(DATABASE_URL_ENV).ok())?;

    if let Some(batch_size) = cli.batch_size {
        anyhow::ensure!(batch_size > 0, "--batch-size must be positive");
        config.runner.batch_size = batch_size;
    }
    if let Commands::RunLoop { interval, stagger } = &cli.command {
        if let Some(secs) = interval {
            anyhow::ensure!(*secs > 0, "--interval must be positive");
            config.controller.interval = Duration::from_secs(*secs);
        }
        if let Some(secs) = stagger {
            config.controller.startup_stagger = Duration::from_secs(*secs);
        }
    }
    Ok(config)
}

async fn run(cli: Cli, config: ResolvedConfig) -> Result<()> {
    // The loop rides out an unreachable database like any other transient
    // cycle error; one-shot commands should fail fast instead.
    let pool = if matches!(cli.command, Commands::RunLoop { .. }) {
        queue::connect_lazy(&config.database_url, config.max_connections, config.acquire_timeout)
            .context("invalid database configuration")?
    } else {
        queue::connect(&config.database_url, config.max_connections, config.acquire_timeout)
            .await
            .context("failed to connect to the database")?
    };
    let store = PostgresWorkQueueStore::new(pool.clone(), &config.table, config.retry.clone())?;

    info!(
        queue = %config.queue,
        table = %config.table,
        procedure = %config.procedure,
        max_retries = config.retry.max_retries,
        "daemon starting"
    );

    let delegate = StoredProcedureDelegate::new(pool, &config.procedure)?;
    let runner = BatchRunner::new(config.queue.as_str(), store, delegate, config.runner);
    let shutdown = CancellationToken::new();
    let mut controller =
        DaemonController::new(runner, config.tiers, config.controller, shutdown.clone());

    match cli.command {
        Commands::RunOnce => {
            let stats = controller.run_once().await.map_err(fatal)?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Commands::RunTier { tier } => {
            let stats = controller.run_tier(Tier::from(tier)).await.map_err(fatal)?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Commands::RunLoop { .. } => {
            let signals = install_signal_handlers(shutdown.clone())
                .context("failed to install signal handlers")?;
            let result = controller.run_loop().await;
            signals.abort();
            result.map_err(fatal)?;
        }
        Commands::DeadLetters(command) => {
            dead_letters(controller.runner().store(), command).await?;
        }
    }
    Ok(())
}

async fn dead_letters<S: WorkQueueStore>(store: &S, command: DeadLetterCommands) -> Result<()> {
    match command {
        DeadLetterCommands::List { limit } => {
            for item in store.list_exhausted(limit).await? {
                println!("{}", serde_json::to_string(&item)?);
            }
        }
        DeadLetterCommands::Requeue { id } => {
            let item = store.requeue_exhausted(id).await?;
            info!(item = %item.id, subject = %item.subject_ref, "dead letter requeued");
        }
        DeadLetterCommands::Discard { id } => {
            store.discard_exhausted(id).await?;
            info!(item = %id, "dead letter discarded");
        }
    }
    Ok(())
}

fn fatal(err: SchedulerError) -> anyhow::Error {
    anyhow::Error::new(err).context("scheduler stopped")
}
