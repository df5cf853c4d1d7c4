use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::config::WorkerSpec;
use crate::errors::{ArchiveFailed, KillFailed, StartFailed};
use crate::logging::{archive_log, Archived};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Killed {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub name: String,
    pub pid: Option<u32>,
}

/// The OS operations the watchdog depends on.
pub trait ProcessControl {
    /// Terminates every process whose image name starts with `name` and
    /// waits for the kill command to finish.
    async fn kill_by_prefix(&self, name: &str) -> Result<Killed, KillFailed>;
    /// Launches `spec` detached from the watchdog without waiting for it.
    fn spawn_detached(&self, spec: &WorkerSpec) -> Result<Started, StartFailed>;
    async fn schedule_reboot(&self, delay: Duration, message: &str) -> Result<()>;
    async fn cancel_reboot(&self) -> Result<()>;
}

/// [`ProcessControl`] backed by the platform's own kill/shutdown commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemControl;

impl ProcessControl for SystemControl {
    async fn kill_by_prefix(&self, name: &str) -> Result<Killed, KillFailed> {
        let (program, args) = kill_command(name);
        match run_command(program, &args).await {
            Ok(output) if output.status.success() => Ok(Killed {
                name: name.to_string(),
            }),
            Ok(output) => Err(KillFailed {
                name: name.to_string(),
                exit_code: output.status.code(),
                diagnostics: command_diagnostics(&output),
            }),
            Err(err) => Err(KillFailed {
                name: name.to_string(),
                exit_code: None,
                diagnostics: format!("{err:#}"),
            }),
        }
    }

    fn spawn_detached(&self, spec: &WorkerSpec) -> Result<Started, StartFailed> {
        let program = worker_program(spec);
        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &spec.dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            // New session, so the worker outlives the watchdog and its terminal.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }
        }
        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = command.spawn().map_err(|err| StartFailed {
            name: spec.name.clone(),
            reason: format!("{}: {err}", program.display()),
        })?;
        Ok(Started {
            name: spec.name.clone(),
            pid: child.id(),
        })
    }

    async fn schedule_reboot(&self, delay: Duration, message: &str) -> Result<()> {
        let (program, args) = reboot_command(delay, message);
        let output = run_command(program, &args).await?;
        if !output.status.success() {
            anyhow::bail!(
                "{program} exited with {}: {}",
                output.status,
                command_diagnostics(&output)
            );
        }
        Ok(())
    }

    async fn cancel_reboot(&self) -> Result<()> {
        let (program, args) = cancel_reboot_command();
        let output = run_command(program, &args).await?;
        if !output.status.success() {
            anyhow::bail!(
                "{program} exited with {}: {}",
                output.status,
                command_diagnostics(&output)
            );
        }
        Ok(())
    }
}

/// Wraps a [`ProcessControl`] with the watchdog's logging and the log archive step.
#[derive(Debug, Clone)]
pub struct Supervisor<C> {
    control: C,
}

impl<C: ProcessControl> Supervisor<C> {
    pub fn new(control: C) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub async fn kill(&self, name: &str) -> Result<Killed, KillFailed> {
        match self.control.kill_by_prefix(name).await {
            Ok(killed) => {
                info!("kill for {} finished successfully", killed.name);
                Ok(killed)
            }
            Err(err) => {
                error!("{err}");
                Err(err)
            }
        }
    }

    pub fn start(&self, spec: &WorkerSpec) -> Result<Started, StartFailed> {
        match self.control.spawn_detached(spec) {
            Ok(started) => {
                info!(
                    "started {} (pid {})",
                    started.name,
                    started
                        .pid
                        .map_or_else(|| "-".to_string(), |pid| pid.to_string())
                );
                Ok(started)
            }
            Err(err) => {
                warn!("{err}");
                Err(err)
            }
        }
    }

    pub fn archive_log(
        &self,
        log_file: &Path,
        now: NaiveDateTime,
    ) -> Result<Archived, ArchiveFailed> {
        match archive_log(log_file, now) {
            Ok(archived) => {
                info!(
                    "log {} archived to {} ({} bytes)",
                    log_file.display(),
                    archived.archive.display(),
                    archived.bytes
                );
                Ok(archived)
            }
            Err(err) => {
                warn!("{err}");
                Err(err)
            }
        }
    }

    pub async fn reboot(&self, delay: Duration, message: &str) -> Result<()> {
        self.control.schedule_reboot(delay, message).await
    }
}

async fn run_command(program: &str, args: &[String]) -> Result<Output> {
    timeout(
        COMMAND_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .with_context(|| format!("{program} timed out after {}s", COMMAND_TIMEOUT.as_secs()))?
    .with_context(|| format!("failed to run {program}"))
}

/// Stderr, falling back to stdout; tools like taskkill report errors on either.
fn command_diagnostics(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return stderr.trim().to_string();
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn worker_program(spec: &WorkerSpec) -> PathBuf {
    match &spec.dir {
        Some(dir) => dir.join(&spec.name),
        None => PathBuf::from(&spec.name),
    }
}

#[cfg(windows)]
fn kill_command(name: &str) -> (&'static str, Vec<String>) {
    (
        "taskkill",
        vec![
            "/IM".to_string(),
            format!("{name}*"),
            "/F".to_string(),
            "/T".to_string(),
        ],
    )
}

#[cfg(not(windows))]
fn kill_command(name: &str) -> (&'static str, Vec<String>) {
    (
        "pkill",
        vec![
            "-KILL".to_string(),
            "--".to_string(),
            format!("^{}", escape_pattern(name)),
        ],
    )
}

#[cfg(windows)]
fn reboot_command(delay: Duration, message: &str) -> (&'static str, Vec<String>) {
    (
        "shutdown",
        vec![
            "/r".to_string(),
            "/t".to_string(),
            delay.as_secs().to_string(),
            "/f".to_string(),
            "/c".to_string(),
            message.to_string(),
        ],
    )
}

#[cfg(not(windows))]
fn reboot_command(delay: Duration, message: &str) -> (&'static str, Vec<String>) {
    // shutdown(8) schedules in whole minutes.
    let minutes = delay.as_secs().div_ceil(60);
    (
        "shutdown",
        vec![
            "-r".to_string(),
            format!("+{minutes}"),
            message.to_string(),
        ],
    )
}

#[cfg(windows)]
fn cancel_reboot_command() -> (&'static str, Vec<String>) {
    ("shutdown", vec!["/a".to_string()])
}

#[cfg(not(windows))]
fn cancel_reboot_command() -> (&'static str, Vec<String>) {
    ("shutdown", vec!["-c".to_string()])
}

#[cfg(not(windows))]
fn escape_pattern(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for ch in name.chars() {
        if "\\.^$|?*+()[]{}".contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Scripted [`ProcessControl`] that tracks a set of "running" image names.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FakeControl {
    running: std::cell::RefCell<Vec<String>>,
    kill_failures: std::cell::RefCell<Vec<(String, usize)>>,
    logs_on_start: std::cell::RefCell<std::collections::HashMap<String, (PathBuf, String)>>,
    reboot_failures: std::cell::Cell<usize>,
    pub kills: std::cell::RefCell<Vec<String>>,
    pub starts: std::cell::RefCell<Vec<String>>,
    pub reboots: std::cell::Cell<usize>,
}

#[cfg(test)]
impl FakeControl {
    pub fn with_running(names: &[&str]) -> Self {
        let control = Self::default();
        control
            .running
            .borrow_mut()
            .extend(names.iter().map(|name| name.to_string()));
        control
    }

    /// The first `times` kills of `name` fail as if the kill command errored.
    pub fn fail_kills(&self, name: &str, times: usize) {
        for attempt in 1..=times {
            self.fail_nth_kill(name, attempt);
        }
    }

    /// The `attempt`-th kill of `name` (1-based) fails.
    pub fn fail_nth_kill(&self, name: &str, attempt: usize) {
        self.kill_failures
            .borrow_mut()
            .push((name.to_string(), attempt));
    }

    pub fn fail_reboots(&self, times: usize) {
        self.reboot_failures.set(times);
    }

    /// Starting `name` writes `contents` to `log_file`, like a fresh miner would.
    pub fn write_log_on_start(&self, name: &str, log_file: &Path, contents: &str) {
        self.logs_on_start.borrow_mut().insert(
            name.to_string(),
            (log_file.to_path_buf(), contents.to_string()),
        );
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.borrow().iter().any(|running| running == name)
    }
}

#[cfg(test)]
impl ProcessControl for FakeControl {
    async fn kill_by_prefix(&self, name: &str) -> Result<Killed, KillFailed> {
        self.kills.borrow_mut().push(name.to_string());
        let attempt = self
            .kills
            .borrow()
            .iter()
            .filter(|killed| killed.as_str() == name)
            .count();

        let scripted = self
            .kill_failures
            .borrow()
            .iter()
            .any(|(failing, nth)| failing == name && *nth == attempt);
        if scripted {
            return Err(KillFailed {
                name: name.to_string(),
                exit_code: Some(1),
                diagnostics: "ERROR: access denied".to_string(),
            });
        }

        let mut running = self.running.borrow_mut();
        let before = running.len();
        running.retain(|candidate| !candidate.starts_with(name));
        if running.len() == before {
            return Err(KillFailed {
                name: name.to_string(),
                exit_code: Some(128),
                diagnostics: format!("ERROR: The process \"{name}*\" not found."),
            });
        }
        Ok(Killed {
            name: name.to_string(),
        })
    }

    fn spawn_detached(&self, spec: &WorkerSpec) -> Result<Started, StartFailed> {
        self.starts.borrow_mut().push(spec.name.clone());
        self.running.borrow_mut().push(spec.name.clone());
        if let Some((path, contents)) = self.logs_on_start.borrow().get(&spec.name) {
            std::fs::write(path, contents).map_err(|err| StartFailed {
                name: spec.name.clone(),
                reason: err.to_string(),
            })?;
        }
        Ok(Started {
            name: spec.name.clone(),
            pid: Some(4242),
        })
    }

    async fn schedule_reboot(&self, _delay: Duration, _message: &str) -> Result<()> {
        let remaining = self.reboot_failures.get();
        if remaining > 0 {
            self.reboot_failures.set(remaining - 1);
            anyhow::bail!("shutdown could not be executed");
        }
        self.reboots.set(self.reboots.get() + 1);
        Ok(())
    }

    async fn cancel_reboot(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::time::Duration;

    use super::{kill_command, reboot_command, worker_program};
    use crate::config::WorkerSpec;

    #[test]
    fn worker_program_resolves_inside_working_directory() {
        let spec = WorkerSpec {
            name: "miner".to_string(),
            dir: Some(PathBuf::from("/opt/miner")),
            args: vec!["--fee".to_string(), "0".to_string()],
        };
        assert_eq!(worker_program(&spec), PathBuf::from("/opt/miner/miner"));

        let bare = WorkerSpec {
            dir: None,
            ..spec
        };
        assert_eq!(worker_program(&bare), PathBuf::from("miner"));
    }

    #[cfg(not(windows))]
    #[test]
    fn kill_matches_escaped_name_prefix() {
        let (program, args) = kill_command("miner.v0+1");
        assert_eq!(program, "pkill");
        assert_eq!(args, vec!["-KILL", "--", "^miner\\.v0\\+1"]);
    }

    #[cfg(windows)]
    #[test]
    fn kill_matches_image_name_wildcard() {
        let (program, args) = kill_command("miner.exe");
        assert_eq!(program, "taskkill");
        assert_eq!(args, vec!["/IM", "miner.exe*", "/F", "/T"]);
    }

    #[cfg(not(windows))]
    #[test]
    fn reboot_delay_rounds_up_to_whole_minutes() {
        let (_, args) = reboot_command(Duration::from_secs(20), "Miner is not responding.");
        assert_eq!(args, vec!["-r", "+1", "Miner is not responding."]);

        let (_, args) = reboot_command(Duration::from_secs(120), "bye");
        assert_eq!(args[1], "+2");
    }

    #[cfg(windows)]
    #[test]
    fn reboot_is_forced_with_delay_and_comment() {
        let (_, args) = reboot_command(Duration::from_secs(20), "Miner is not responding.");
        assert_eq!(
            args,
            vec!["/r", "/t", "20", "/f", "/c", "Miner is not responding."]
        );
    }
}
