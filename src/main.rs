mod analyzer;
mod cli;
mod clock;
mod config;
mod errors;
mod logging;
mod recovery;
mod stats;
mod supervisor;
mod watchdog;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::analyzer::detect;
use crate::cli::{Cli, Commands, RebootCommand, StatsCommand};
use crate::clock::{Clock, SystemClock};
use crate::config::WatchdogConfig;
use crate::logging::read_log_lines;
use crate::stats::{format_uptime, init_stats, load_stats};
use crate::supervisor::{ProcessControl, SystemControl};
use crate::watchdog::WatchdogLoop;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run => run(config_path).await,
        Commands::Check { log } => check(config_path, log),
        Commands::Stats {
            command: StatsCommand::Init { file, force },
        } => {
            let path = stats_path(config_path, file)?;
            init_stats(&path, SystemClock.today(), force)?;
            println!("Initialized {}", path.display());
            Ok(())
        }
        Commands::Stats {
            command: StatsCommand::Show { file, json },
        } => show_stats(&stats_path(config_path, file)?, json),
        Commands::Reboot {
            command: RebootCommand::Cancel,
        } => {
            SystemControl
                .cancel_reboot()
                .await
                .context("failed to cancel pending reboot")?;
            println!("Pending reboot cancelled");
            Ok(())
        }
    }
}

async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = WatchdogConfig::load(config_path)?;
    let stats = load_stats(&config.stats_file)?;
    info!(
        "minerwatch {} starting; {} recoveries so far",
        env!("MINERWATCH_BUILD_VERSION"),
        stats.total_recoveries
    );
    WatchdogLoop::new(config, SystemControl, SystemClock, stats)
        .run()
        .await
}

fn check(config_path: Option<&Path>, log: Option<PathBuf>) -> Result<()> {
    let config = WatchdogConfig::load(config_path)?;
    let log_file = log.unwrap_or_else(|| config.log_file.clone());
    let lines = read_log_lines(&log_file)
        .with_context(|| format!("failed to read {}", log_file.display()))?;
    println!("{}", detect(&lines, &config.markers));
    Ok(())
}

fn show_stats(path: &Path, as_json: bool) -> Result<()> {
    let stats = load_stats(path)?;
    if as_json {
        let payload = json!({
            "total_uptime_ms": stats.total_uptime.as_millis() as u64,
            "total_recoveries": stats.total_recoveries,
            "today_recoveries": stats.today_recoveries,
            "last_recovery_date": stats.last_recovery_date.to_string(),
            "last_recovery_at": stats.last_recovery_at.map(|_| stats.last_recovery_label()),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Total uptime:      {}", format_uptime(stats.total_uptime));
    println!("Total recoveries:  {}", stats.total_recoveries);
    println!(
        "Today recoveries:  {} ({})",
        stats.today_recoveries, stats.last_recovery_date
    );
    println!("Last recovery:     {}", stats.last_recovery_label());
    Ok(())
}

fn stats_path(config_path: Option<&Path>, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(WatchdogConfig::load(config_path)?.stats_file),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
