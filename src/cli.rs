use std::path::PathBuf;

use clap::{Parser, Subcommand};

const BUILD_VERSION: &str = env!("MINERWATCH_BUILD_VERSION");
const HELP_AFTER: &str = "\
Examples
  minerwatch stats init
  minerwatch run
  minerwatch check --log C:/miner/miner.log
  minerwatch reboot cancel

Config is read from --config, $MINERWATCH_CONFIG, or $MINERWATCH_HOME/minerwatch.toml.
";

#[derive(Debug, Parser)]
#[command(
    name = "minerwatch",
    version = BUILD_VERSION,
    about = "Reboots the rig when the GPU miner hangs",
    after_help = HELP_AFTER
)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Watch the miner log and recover on hangs.
    Run,
    /// Check a log file once and print the verdict.
    Check {
        /// Log to inspect instead of the configured one.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
    Reboot {
        #[command(subcommand)]
        command: RebootCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    /// Create a zeroed stats file.
    Init {
        /// Stats file to use instead of the configured one.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Show {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum RebootCommand {
    /// Abort a pending scheduled reboot.
    Cancel,
}
