use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::analyzer::MarkerSet;
use crate::errors::WatchdogError;

const CONFIG_FILE_NAME: &str = "minerwatch.toml";
const STATS_FILE_NAME: &str = "stats.txt";

/// A process the watchdog may kill and relaunch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Image name; kills match every process whose name starts with it.
    pub name: String,
    pub dir: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPolicy {
    RebootOnly,
    RestartThenVerify {
        primary: WorkerSpec,
        secondary: Option<WorkerSpec>,
    },
}

impl std::fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            RecoveryPolicy::RebootOnly => "reboot-only",
            RecoveryPolicy::RestartThenVerify { .. } => "restart-then-verify",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub log_file: PathBuf,
    pub stats_file: PathBuf,
    pub poll_interval: Duration,
    pub report_every: u32,
    pub persist_every: u32,
    pub markers: MarkerSet,
    pub primary: WorkerSpec,
    pub policy: RecoveryPolicy,
    pub teardown_grace: Duration,
    pub verify_grace: Duration,
    pub reboot_delay: Duration,
    pub reboot_message: String,
    pub reboot_retry: Duration,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
enum PolicyName {
    #[default]
    RebootOnly,
    RestartThenVerify,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorker {
    name: String,
    #[serde(default)]
    dir: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    log_file: PathBuf,
    #[serde(default)]
    stats_file: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_report_every")]
    report_every: u32,
    #[serde(default = "default_persist_every")]
    persist_every: u32,
    #[serde(default)]
    policy: PolicyName,
    #[serde(default = "default_teardown_grace_secs")]
    teardown_grace_secs: u64,
    #[serde(default = "default_verify_grace_secs")]
    verify_grace_secs: u64,
    #[serde(default = "default_reboot_delay_secs")]
    reboot_delay_secs: u64,
    #[serde(default = "default_reboot_message")]
    reboot_message: String,
    #[serde(default = "default_reboot_retry_secs")]
    reboot_retry_secs: u64,
    markers: MarkerSet,
    primary: RawWorker,
    #[serde(default)]
    secondary: Option<RawWorker>,
}

impl WatchdogConfig {
    /// Resolves the config location, parses it, and validates every field.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let home = home_dir();
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                env::var("MINERWATCH_CONFIG")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| home.join(CONFIG_FILE_NAME));

        let payload = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&payload, &home)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(payload: &str, home: &Path) -> Result<Self, WatchdogError> {
        let raw: RawConfig = toml::from_str(payload)?;
        Self::from_raw(raw, home)
    }

    fn from_raw(raw: RawConfig, home: &Path) -> Result<Self, WatchdogError> {
        if raw.log_file.as_os_str().is_empty() {
            return Err(WatchdogError::invalid_config("log_file", "must not be empty"));
        }
        if raw.poll_interval_secs == 0 {
            return Err(WatchdogError::invalid_config(
                "poll_interval_secs",
                "must be at least 1",
            ));
        }
        if raw.report_every == 0 {
            return Err(WatchdogError::invalid_config("report_every", "must be at least 1"));
        }
        if raw.persist_every == 0 {
            return Err(WatchdogError::invalid_config("persist_every", "must be at least 1"));
        }
        for (key, value) in raw.markers.entries() {
            if value.trim().is_empty() {
                return Err(WatchdogError::invalid_config(key, "marker must not be blank"));
            }
        }

        let primary = worker_from_raw("primary.name", raw.primary)?;
        let secondary = raw
            .secondary
            .map(|worker| worker_from_raw("secondary.name", worker))
            .transpose()?;

        let policy = match raw.policy {
            PolicyName::RebootOnly => RecoveryPolicy::RebootOnly,
            PolicyName::RestartThenVerify => {
                if primary.dir.is_none() {
                    return Err(WatchdogError::invalid_config(
                        "primary.dir",
                        "required by the restart_then_verify policy",
                    ));
                }
                if secondary.as_ref().is_some_and(|worker| worker.dir.is_none()) {
                    return Err(WatchdogError::invalid_config(
                        "secondary.dir",
                        "required by the restart_then_verify policy",
                    ));
                }
                RecoveryPolicy::RestartThenVerify {
                    primary: primary.clone(),
                    secondary,
                }
            }
        };

        Ok(Self {
            log_file: raw.log_file,
            stats_file: raw
                .stats_file
                .unwrap_or_else(|| home.join(STATS_FILE_NAME)),
            poll_interval: Duration::from_secs(raw.poll_interval_secs),
            report_every: raw.report_every,
            persist_every: raw.persist_every,
            markers: raw.markers,
            primary,
            policy,
            teardown_grace: Duration::from_secs(raw.teardown_grace_secs),
            verify_grace: Duration::from_secs(raw.verify_grace_secs),
            reboot_delay: Duration::from_secs(raw.reboot_delay_secs),
            reboot_message: raw.reboot_message,
            reboot_retry: Duration::from_secs(raw.reboot_retry_secs),
        })
    }
}

/// `$MINERWATCH_HOME`, else the platform local data dir.
pub fn home_dir() -> PathBuf {
    env::var("MINERWATCH_HOME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(env::temp_dir)
                .join("minerwatch")
        })
}

fn worker_from_raw(field: &'static str, raw: RawWorker) -> Result<WorkerSpec, WatchdogError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(WatchdogError::invalid_config(field, "must not be empty"));
    }
    Ok(WorkerSpec {
        name,
        dir: raw.dir,
        args: raw.args,
    })
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_report_every() -> u32 {
    2
}

fn default_persist_every() -> u32 {
    20
}

fn default_teardown_grace_secs() -> u64 {
    5
}

fn default_verify_grace_secs() -> u64 {
    60
}

fn default_reboot_delay_secs() -> u64 {
    20
}

fn default_reboot_message() -> String {
    "Miner is not responding.".to_string()
}

fn default_reboot_retry_secs() -> u64 {
    5
}
