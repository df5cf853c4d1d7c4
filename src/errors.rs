use std::path::PathBuf;

use thiserror::Error;

/// Conditions that stop the watchdog before its loop starts.
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("stats file {0} does not exist (run `minerwatch stats init` first)")]
    StatsMissing(PathBuf),
    #[error("stats file {0} already exists")]
    StatsExists(PathBuf),
    #[error("stats file is missing key `{0}`")]
    MissingStatsKey(&'static str),
    #[error("stats line {line} is malformed: {content:?}")]
    MalformedStatsLine { line: usize, content: String },
    #[error("stats key `{key}` has invalid value {value:?}")]
    InvalidStatsValue { key: &'static str, value: String },
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl WatchdogError {
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to kill processes matching {name}*: {}", describe_failure(.exit_code, .diagnostics))]
pub struct KillFailed {
    pub name: String,
    pub exit_code: Option<i32>,
    pub diagnostics: String,
}

#[derive(Debug, Error)]
#[error("failed to start {name}: {reason}")]
pub struct StartFailed {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("failed to archive {}: {reason}", .path.display())]
pub struct ArchiveFailed {
    pub path: PathBuf,
    pub reason: String,
}

fn describe_failure(exit_code: &Option<i32>, diagnostics: &str) -> String {
    let status = exit_code.map_or_else(
        || "no exit status".to_string(),
        |code| format!("exit code {code}"),
    );
    let diagnostics = diagnostics.trim();
    if diagnostics.is_empty() {
        status
    } else {
        format!("{status}: {diagnostics}")
    }
}
