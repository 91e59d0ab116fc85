use std::env;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lotto-cli")]
#[command(about = "Keeps the local lottery draw archive in sync with upstream")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass (default)
    Sync,
    /// Re-send notifications for the archived latest draw
    Notify,
    /// Show what the archive currently holds
    Status,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("LOTTO_LOG").unwrap_or_else(|_| EnvFilter::new("lotto=info,warn"));
    let format = env::var("LOTTO_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = lotto_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} source={} ({}) {}",
                if summary.outcome.is_failure() { "failed" } else { "complete" },
                summary.run_id,
                summary.source_id,
                summary.source_name,
                summary.outcome
            );
            if let Some(report) = &summary.notification {
                println!(
                    "notifications: delivered={} attempted={}",
                    report.delivered, report.attempted
                );
            }
            if summary.outcome.is_failure() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Notify => {
            let report = lotto_sync::notify_latest_from_env().await?;
            println!(
                "notifications: delivered={} attempted={}",
                report.delivered, report.attempted
            );
            for (topic, error) in &report.failures {
                eprintln!("  {topic}: {error}");
            }
        }
        Commands::Status => {
            let status = lotto_sync::archive_status_from_env().await?;
            println!("archive: {}", status.path.display());
            println!("entries: {}", status.entries);
            println!("head: {}", status.head_date.as_deref().unwrap_or("-"));
            println!(
                "last_updated: {}",
                status.last_updated.as_deref().unwrap_or("-")
            );
            if status.dropped_entries > 0 {
                println!("invalid entries ignored: {}", status.dropped_entries);
            }
            println!("next run: {}", status.next_strategy);
        }
    }

    Ok(ExitCode::SUCCESS)
}
