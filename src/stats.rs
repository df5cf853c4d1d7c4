use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use tracing::warn;

use crate::errors::WatchdogError;

const KEY_TOTAL_UPTIME_MS: &str = "total_uptime_ms";
const KEY_TOTAL_RECOVERIES: &str = "total_recoveries";
const KEY_TODAY_RECOVERIES: &str = "today_recoveries";
const KEY_LAST_RECOVERY_DATE: &str = "last_recovery_date";
const KEY_LAST_RECOVERY_AT: &str = "last_recovery_at";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Recovery counters that survive watchdog restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogStats {
    /// Kept at millisecond resolution so the persisted form round-trips.
    pub total_uptime: Duration,
    pub total_recoveries: u64,
    pub today_recoveries: u64,
    /// Date of the last observed tick; drives day rollover.
    pub last_recovery_date: NaiveDate,
    pub last_recovery_at: Option<NaiveDateTime>,
}

impl WatchdogStats {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            total_uptime: Duration::ZERO,
            total_recoveries: 0,
            today_recoveries: 0,
            last_recovery_date: today,
            last_recovery_at: None,
        }
    }

    /// Adds the whole milliseconds of `elapsed` and returns how much was consumed,
    /// so callers can carry the sub-millisecond remainder into the next tick.
    pub fn advance_uptime(&mut self, elapsed: Duration) -> Duration {
        let consumed = Duration::from_millis(elapsed.as_millis().min(u64::MAX as u128) as u64);
        self.total_uptime = self.total_uptime.saturating_add(consumed);
        consumed
    }

    /// Resets the daily counter when `today` differs from the recorded date.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.last_recovery_date == today {
            return false;
        }
        self.last_recovery_date = today;
        self.today_recoveries = 0;
        true
    }

    pub fn record_recovery(&mut self, now: NaiveDateTime) {
        self.total_recoveries = self.total_recoveries.saturating_add(1);
        if self.last_recovery_date == now.date() {
            self.today_recoveries = self.today_recoveries.saturating_add(1);
        } else {
            self.today_recoveries = 1;
            self.last_recovery_date = now.date();
        }
        // Persisted at second resolution.
        self.last_recovery_at = Some(truncate_to_seconds(now));
    }

    pub fn last_recovery_label(&self) -> String {
        self.last_recovery_at.map_or_else(
            || "never".to_string(),
            |at| at.format(TIMESTAMP_FORMAT).to_string(),
        )
    }

    pub fn to_record(&self) -> String {
        let last_at = self
            .last_recovery_at
            .map(|at| at.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        format!(
            "{KEY_TOTAL_UPTIME_MS}={}\n{KEY_TOTAL_RECOVERIES}={}\n{KEY_TODAY_RECOVERIES}={}\n{KEY_LAST_RECOVERY_DATE}={}\n{KEY_LAST_RECOVERY_AT}={last_at}\n",
            self.total_uptime.as_millis(),
            self.total_recoveries,
            self.today_recoveries,
            self.last_recovery_date.format(DATE_FORMAT),
        )
    }

    pub fn parse_record(content: &str) -> Result<Self, WatchdogError> {
        let mut values = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(WatchdogError::MalformedStatsLine {
                    line: idx + 1,
                    content: line.to_string(),
                });
            };
            values.insert(key.trim(), value.trim());
        }

        for key in values.keys() {
            if !known_key(key) {
                warn!("ignoring unknown stats key `{key}`");
            }
        }

        let uptime_ms: u64 = parse_value(&values, KEY_TOTAL_UPTIME_MS, |v| v.parse().ok())?;
        let last_recovery_at = match required(&values, KEY_LAST_RECOVERY_AT)? {
            "" => None,
            value => Some(
                NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|_| {
                    WatchdogError::InvalidStatsValue {
                        key: KEY_LAST_RECOVERY_AT,
                        value: value.to_string(),
                    }
                })?,
            ),
        };

        Ok(Self {
            total_uptime: Duration::from_millis(uptime_ms),
            total_recoveries: parse_value(&values, KEY_TOTAL_RECOVERIES, |v| v.parse().ok())?,
            today_recoveries: parse_value(&values, KEY_TODAY_RECOVERIES, |v| v.parse().ok())?,
            last_recovery_date: parse_value(&values, KEY_LAST_RECOVERY_DATE, |v| {
                NaiveDate::parse_from_str(v, DATE_FORMAT).ok()
            })?,
            last_recovery_at,
        })
    }
}

/// Reads the stats file; a missing or corrupt file is a startup failure.
pub fn load_stats(path: &Path) -> Result<WatchdogStats> {
    if !path.exists() {
        return Err(WatchdogError::StatsMissing(path.to_path_buf()).into());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read stats file {}", path.display()))?;
    let stats = WatchdogStats::parse_record(&content)
        .with_context(|| format!("stats file {} is corrupt", path.display()))?;
    Ok(stats)
}

/// Writes the full record to a sibling temp file, then renames it over `path`.
pub fn save_stats(path: &Path, stats: &WatchdogStats) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = tmp_stats_path(path);
    fs::write(&tmp_path, stats.to_record())
        .with_context(|| format!("failed to write temporary stats {}", tmp_path.display()))?;
    replace_stats_file(&tmp_path, path)
}

/// Creates a zeroed stats file, refusing to clobber an existing one unless forced.
pub fn init_stats(path: &Path, today: NaiveDate, force: bool) -> Result<WatchdogStats> {
    if path.exists() && !force {
        return Err(WatchdogError::StatsExists(path.to_path_buf()).into());
    }
    let stats = WatchdogStats::new(today);
    save_stats(path, &stats)?;
    Ok(stats)
}

/// `HH:MM` of the current session.
pub fn format_session(elapsed: Duration) -> String {
    let minutes = elapsed.as_secs() / 60;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn format_uptime(total: Duration) -> String {
    let minutes = total.as_secs() / 60;
    let days = minutes / (60 * 24);
    let hours = (minutes / 60) % 24;
    format!("{days} days {hours} hours {} minutes", minutes % 60)
}

fn tmp_stats_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn replace_stats_file(tmp_path: &Path, path: &Path) -> Result<()> {
    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            #[cfg(windows)]
            {
                if path.exists() {
                    fs::remove_file(path).with_context(|| {
                        format!("failed to remove stats file {}", path.display())
                    })?;
                    fs::rename(tmp_path, path).with_context(|| {
                        format!("failed to replace stats file {}", path.display())
                    })?;
                    return Ok(());
                }
            }

            Err(rename_err)
                .with_context(|| format!("failed to replace stats file {}", path.display()))
        }
    }
}

fn known_key(key: &str) -> bool {
    matches!(
        key,
        KEY_TOTAL_UPTIME_MS
            | KEY_TOTAL_RECOVERIES
            | KEY_TODAY_RECOVERIES
            | KEY_LAST_RECOVERY_DATE
            | KEY_LAST_RECOVERY_AT
    )
}

fn required<'a>(
    values: &HashMap<&str, &'a str>,
    key: &'static str,
) -> Result<&'a str, WatchdogError> {
    values
        .get(key)
        .copied()
        .ok_or(WatchdogError::MissingStatsKey(key))
}

fn parse_value<T>(
    values: &HashMap<&str, &str>,
    key: &'static str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, WatchdogError> {
    let raw = required(values, key)?;
    parse(raw).ok_or_else(|| WatchdogError::InvalidStatsValue {
        key,
        value: raw.to_string(),
    })
}

fn truncate_to_seconds(at: NaiveDateTime) -> NaiveDateTime {
    at.date()
        .and_hms_opt(at.hour(), at.minute(), at.second())
        .unwrap_or(at)
}
