//! Intake - operator command line

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intake_common::logging::{init_logging, LogConfig, LogLevel};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use intake_core::config::Config;
use intake_core::db::{create_pool, health_check, run_migrations};
use intake_core::store::PgStore;
use intake_core::Intake;

#[derive(Parser, Debug)]
#[command(name = "intake")]
#[command(author, version, about = "Archive ingestion tracking", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Show per-status file counts of an import
    Stats {
        #[arg(long = "import", value_name = "IMPORT_ID")]
        import_id: Uuid,
    },

    /// Recompute batch counters from file statuses and roll up its status
    Reconcile {
        #[arg(long = "batch", value_name = "BATCH_ID")]
        batch_id: Uuid,
    },

    /// Cancel a batch; claims for its imports stop immediately
    CancelBatch {
        #[arg(long = "batch", value_name = "BATCH_ID")]
        batch_id: Uuid,
    },

    /// Report or fail files stuck in processing
    RecoverStalled {
        /// Maximum number of files handled in one run
        #[arg(long, default_value_t = 500)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let defaults = LogConfig {
        level: if cli.verbose { LogLevel::Debug } else { LogLevel::Info },
        ..LogConfig::default()
    }
    .with_file_prefix("intake")
    .with_filter_directives("sqlx=warn");

    // Environment variables take precedence
    let log_config = defaults.clone().merge_env().unwrap_or(defaults);

    // The CLI keeps working without logging
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = run(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let pool = create_pool(&config.database).await?;
    health_check(&pool).await?;

    if let Commands::Migrate = command {
        run_migrations(&pool).await?;
        return Ok(());
    }

    let intake = Intake::new(Arc::new(PgStore::new(pool)), config.policy.clone());

    match command {
        Commands::Migrate => {},
        Commands::Stats { import_id } => {
            let stats = intake.queue.queue_stats(import_id).await?;
            print_json(&stats)?;
        },
        Commands::Reconcile { batch_id } => {
            let batch = intake.batches.reconcile(batch_id).await?;
            info!(batch_id = %batch.id, status = %batch.status, "Batch reconciled");
            print_json(&batch)?;
        },
        Commands::CancelBatch { batch_id } => {
            let batch = intake.batches.cancel(batch_id).await?;
            print_json(&batch)?;
        },
        Commands::RecoverStalled { limit } => {
            let report = intake.queue.recover_stalled(chrono::Utc::now(), limit).await?;
            info!(
                recovery = ?report.recovery,
                files = report.files.len(),
                "Stall scan finished"
            );
            print_json(&report)?;
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
