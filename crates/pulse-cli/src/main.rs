use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use pulse_core::{source_today, DateWindow, MAX_DAYS_TO_FETCH};
use pulse_storage::HealthStore;
use pulse_sync::{export_csv, export_parquet_snapshot, run_sync_once, RunStatus, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Pulse health metrics sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the configured window from the source and upsert it locally.
    Sync {
        /// Exit with status 2 when some dates or activities failed.
        #[arg(long)]
        strict: bool,
    },
    /// Create or upgrade the local database schema.
    Migrate,
    /// Serve the read-only dashboard.
    Serve,
    /// Write stored daily summaries as CSV, optionally with a Parquet snapshot.
    Export {
        #[arg(long, default_value_t = 90)]
        days: i64,
        /// CSV destination; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Directory for a Parquet snapshot and its manifest.
        #[arg(long)]
        parquet: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync { strict: false })).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = SyncConfig::from_env().context("reading configuration")?;

    match command {
        Commands::Sync { strict } => {
            let invocation = run_sync_once(&config).await?;
            let report = &invocation.report;
            println!(
                "sync {}: run_id={} days={}/{} (no data {}, failed {}) activities={}/{} (failed {}) elapsed={}ms reports={}",
                match &report.status {
                    RunStatus::Succeeded => "succeeded",
                    RunStatus::PartialFailure => "partially failed",
                    RunStatus::Aborted { .. } => "aborted",
                },
                report.run_id,
                report.days.succeeded,
                report.days.attempted,
                report.days.no_data,
                report.days.failed,
                report.activities.succeeded,
                report.activities.attempted,
                report.activities.failed,
                report.elapsed_ms,
                invocation.reports_dir.display()
            );
            if let RunStatus::Aborted { reason, .. } = &report.status {
                eprintln!("Error: {reason}");
            }
            let code = report.exit_code(strict);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Commands::Migrate => {
            let store = HealthStore::open(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            let counts = store.counts().await?;
            store.close().await;
            info!(database_url = %config.database_url, "schema up to date");
            println!(
                "migrated {}: {} daily summaries, {} activities, {} heart-rate samples",
                config.database_url, counts.daily_summaries, counts.activities, counts.heart_rate_samples
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            pulse_web::serve_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Export { days, out, parquet } => {
            let days = days.clamp(1, MAX_DAYS_TO_FETCH);
            let today = source_today(Utc::now(), config.source_tz);
            let window = DateWindow::new(today - ChronoDuration::days(days), today);
            let store = HealthStore::open(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;

            let csv = export_csv(&store, window).await?;
            match &out {
                Some(path) => {
                    std::fs::write(path, &csv).with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), %window, "wrote csv export");
                }
                None => print!("{csv}"),
            }
            if let Some(dir) = &parquet {
                let manifest = export_parquet_snapshot(&store, window, dir).await?;
                info!(manifest = %manifest.display(), "wrote parquet snapshot");
            }
            store.close().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}
