//! Recovery of a hung miner, driven as an explicit state machine.
//!
//! ```text
//! Detected -> Archiving -> [RestartAttempt -> Verifying -> Archiving] -> Escalating
//!          -> Persisting <-> RebootPending -> done
//! ```
//!
//! Kill and archive failures abort the pass; the next poll re-detects and
//! starts over. Once escalated, the stats write and then the reboot are
//! retried until each is accepted.

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analyzer::{detect, HangVerdict};
use crate::clock::Clock;
use crate::config::{RecoveryPolicy, WatchdogConfig, WorkerSpec};
use crate::errors::{ArchiveFailed, KillFailed};
use crate::logging::read_log_lines;
use crate::stats::{save_stats, WatchdogStats};
use crate::supervisor::{ProcessControl, Supervisor};

#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Nothing changed beyond what the failed step did; retry on the next poll.
    Aborted(AbortReason),
    /// Workers were restarted and the fresh log shows no hang.
    Restarted,
    /// A reboot was scheduled; the watchdog must stop.
    RebootScheduled,
}

#[derive(Debug)]
pub enum AbortReason {
    Kill(KillFailed),
    Archive(ArchiveFailed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryState {
    Detected,
    Archiving { after_restart: bool },
    RestartAttempt,
    Verifying { secondary_restarted: bool },
    Escalating,
    Persisting,
    RebootPending,
}

pub struct RecoveryOrchestrator<'a, C, K> {
    config: &'a WatchdogConfig,
    supervisor: &'a Supervisor<C>,
    clock: &'a K,
}

impl<'a, C: ProcessControl, K: Clock> RecoveryOrchestrator<'a, C, K> {
    pub fn new(config: &'a WatchdogConfig, supervisor: &'a Supervisor<C>, clock: &'a K) -> Self {
        Self {
            config,
            supervisor,
            clock,
        }
    }

    /// Runs one recovery pass for a detected hang.
    pub async fn recover(&self, stats: &mut WatchdogStats) -> RecoveryOutcome {
        let mut state = RecoveryState::Detected;
        loop {
            state = match state {
                RecoveryState::Detected => {
                    warn!("miner is hanging; killing {}", self.config.primary.name);
                    if let Err(err) = self.supervisor.kill(&self.config.primary.name).await {
                        return RecoveryOutcome::Aborted(AbortReason::Kill(err));
                    }
                    RecoveryState::Archiving {
                        after_restart: false,
                    }
                }
                RecoveryState::Archiving { after_restart } => {
                    if let Err(err) = self
                        .supervisor
                        .archive_log(&self.config.log_file, self.clock.now())
                    {
                        return RecoveryOutcome::Aborted(AbortReason::Archive(err));
                    }
                    match (&self.config.policy, after_restart) {
                        (RecoveryPolicy::RestartThenVerify { .. }, false) => {
                            RecoveryState::RestartAttempt
                        }
                        _ => RecoveryState::Escalating,
                    }
                }
                RecoveryState::RestartAttempt => match &self.config.policy {
                    RecoveryPolicy::RestartThenVerify { primary, secondary } => {
                        match self.restart_workers(primary, secondary.as_ref()).await {
                            Some(secondary_restarted) => RecoveryState::Verifying {
                                secondary_restarted,
                            },
                            None => RecoveryState::Escalating,
                        }
                    }
                    RecoveryPolicy::RebootOnly => RecoveryState::Escalating,
                },
                RecoveryState::Verifying {
                    secondary_restarted,
                } => {
                    if !self.still_hanging() {
                        info!("miner recovered after restart; no reboot needed");
                        return RecoveryOutcome::Restarted;
                    }
                    warn!("miner still hanging after restart; escalating to reboot");
                    if let Err(err) = self.kill_again(secondary_restarted).await {
                        return RecoveryOutcome::Aborted(AbortReason::Kill(err));
                    }
                    RecoveryState::Archiving {
                        after_restart: true,
                    }
                }
                RecoveryState::Escalating => {
                    stats.record_recovery(self.clock.now());
                    info!(
                        "recovery #{} recorded ({} today)",
                        stats.total_recoveries, stats.today_recoveries
                    );
                    RecoveryState::Persisting
                }
                RecoveryState::Persisting => {
                    // The reboot is only issued once the recovery is on disk.
                    match save_stats(&self.config.stats_file, stats) {
                        Ok(()) => RecoveryState::RebootPending,
                        Err(err) => {
                            error!("failed to persist stats before reboot, retrying: {err:#}");
                            sleep(self.config.reboot_retry).await;
                            RecoveryState::Persisting
                        }
                    }
                }
                RecoveryState::RebootPending => {
                    info!("scheduling reboot in {}s", self.config.reboot_delay.as_secs());
                    match self
                        .supervisor
                        .reboot(self.config.reboot_delay, &self.config.reboot_message)
                        .await
                    {
                        Ok(()) => {
                            info!("reboot has been scheduled");
                            return RecoveryOutcome::RebootScheduled;
                        }
                        Err(err) => {
                            error!("reboot could not be scheduled, retrying: {err:#}");
                            sleep(self.config.reboot_retry).await;
                            RecoveryState::Persisting
                        }
                    }
                }
            };
        }
    }

    /// Restarts the workers. Returns whether the secondary was restarted, or
    /// `None` when the primary could not be launched at all.
    async fn restart_workers(
        &self,
        primary: &WorkerSpec,
        secondary: Option<&WorkerSpec>,
    ) -> Option<bool> {
        let secondary_running = match secondary {
            Some(worker) => match self.supervisor.kill(&worker.name).await {
                Ok(_) => true,
                Err(err) => {
                    info!("secondary worker not stopped, leaving it down: {err}");
                    false
                }
            },
            None => false,
        };

        sleep(self.config.teardown_grace).await;

        let mut secondary_restarted = false;
        if let Some(worker) = secondary.filter(|_| secondary_running) {
            secondary_restarted = self.supervisor.start(worker).is_ok();
        }
        if self.supervisor.start(primary).is_err() {
            return None;
        }

        info!(
            "waiting {}s for fresh miner output",
            self.config.verify_grace.as_secs()
        );
        sleep(self.config.verify_grace).await;
        Some(secondary_restarted)
    }

    fn still_hanging(&self) -> bool {
        match read_log_lines(&self.config.log_file) {
            Ok(lines) => {
                let verdict = detect(&lines, &self.config.markers);
                info!("post-restart check: {verdict}");
                verdict != HangVerdict::NoHang
            }
            Err(err) => {
                warn!(
                    "post-restart check could not read {}: {err}",
                    self.config.log_file.display()
                );
                false
            }
        }
    }

    async fn kill_again(&self, secondary_restarted: bool) -> Result<(), KillFailed> {
        self.supervisor.kill(&self.config.primary.name).await?;
        if secondary_restarted {
            if let RecoveryPolicy::RestartThenVerify {
                secondary: Some(worker),
                ..
            } = &self.config.policy
            {
                self.supervisor.kill(&worker.name).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use chrono::{NaiveDate, NaiveDateTime};

    use super::{AbortReason, RecoveryOrchestrator, RecoveryOutcome};
    use crate::analyzer::fixture_markers;
    use crate::clock::ManualClock;
    use crate::config::{RecoveryPolicy, WatchdogConfig, WorkerSpec};
    use crate::stats::{load_stats, WatchdogStats};
    use crate::supervisor::{FakeControl, Supervisor};

    pub(crate) const HUNG_LOG: &str =
        "INFO: Target: 0003c3c3c3...\nGPU0: 290 Sol/s GPU1: 301 Sol/s\nGPU0 not responding\n";
    pub(crate) const CLEAN_LOG: &str =
        "INFO: Target: 0003c3c3c3...\nGPU0: 288 Sol/s GPU1: 305 Sol/s\n";

    pub(crate) fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .expect("valid timestamp")
    }

    pub(crate) fn worker(name: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            dir: Some(PathBuf::from("/opt").join(name)),
            args: Vec::new(),
        }
    }

    pub(crate) fn test_config(dir: &Path, policy: RecoveryPolicy) -> WatchdogConfig {
        WatchdogConfig {
            log_file: dir.join("miner.log"),
            stats_file: dir.join("stats.txt"),
            poll_interval: Duration::ZERO,
            report_every: 2,
            persist_every: 3,
            markers: fixture_markers(),
            primary: worker("miner"),
            policy,
            teardown_grace: Duration::ZERO,
            verify_grace: Duration::ZERO,
            reboot_delay: Duration::from_secs(20),
            reboot_message: "Miner is not responding.".to_string(),
            reboot_retry: Duration::ZERO,
        }
    }

    pub(crate) fn restart_policy(with_secondary: bool) -> RecoveryPolicy {
        RecoveryPolicy::RestartThenVerify {
            primary: worker("miner"),
            secondary: with_secondary.then(|| worker("fancontrol")),
        }
    }

    pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("minerwatch-{prefix}-{nonce}"));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }

    #[tokio::test]
    async fn reboot_only_archives_counts_and_reboots_once() {
        let dir = temp_dir("recover-reboot");
        let config = test_config(&dir, RecoveryPolicy::RebootOnly);
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let supervisor = Supervisor::new(FakeControl::with_running(&["miner.exe"]));
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(outcome, RecoveryOutcome::RebootScheduled));
        assert!(!config.log_file.exists(), "log should be archived");
        let archive = dir.join("logs").join("2026-10-19 07-04.txt");
        assert_eq!(
            fs::metadata(&archive).expect("archive should exist").len(),
            HUNG_LOG.len() as u64
        );
        assert_eq!(stats.total_recoveries, 1);
        assert_eq!(stats.today_recoveries, 1);
        assert_eq!(stats.last_recovery_at, Some(at(19, 7, 4)));
        assert_eq!(supervisor.control().reboots.get(), 1);
        assert!(supervisor.control().starts.borrow().is_empty());
        assert_eq!(
            load_stats(&config.stats_file).expect("stats should be persisted"),
            stats
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn kill_failure_aborts_before_archive() {
        let dir = temp_dir("recover-kill-fail");
        let config = test_config(&dir, RecoveryPolicy::RebootOnly);
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let control = FakeControl::with_running(&["miner.exe"]);
        control.fail_kills("miner", 1);
        let supervisor = Supervisor::new(control);
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());
        let before = stats.clone();

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(
            outcome,
            RecoveryOutcome::Aborted(AbortReason::Kill(_))
        ));
        assert!(config.log_file.exists(), "log must stay in place");
        assert!(!dir.join("logs").exists(), "no archive should be attempted");
        assert_eq!(stats, before);
        assert_eq!(supervisor.control().reboots.get(), 0);
        assert!(!config.stats_file.exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn archive_failure_aborts_without_reboot() {
        let dir = temp_dir("recover-archive-fail");
        let config = test_config(&dir, RecoveryPolicy::RebootOnly);
        let supervisor = Supervisor::new(FakeControl::with_running(&["miner.exe"]));
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(
            outcome,
            RecoveryOutcome::Aborted(AbortReason::Archive(_))
        ));
        assert_eq!(stats.total_recoveries, 0);
        assert_eq!(supervisor.control().reboots.get(), 0);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn clean_log_after_restart_skips_reboot() {
        let dir = temp_dir("recover-restart");
        let config = test_config(&dir, restart_policy(true));
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let control = FakeControl::with_running(&["miner.exe", "fancontrol.exe"]);
        control.write_log_on_start("miner", &config.log_file, CLEAN_LOG);
        let supervisor = Supervisor::new(control);
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());
        let before = stats.clone();

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Restarted));
        assert_eq!(stats, before);
        let control = supervisor.control();
        assert_eq!(control.reboots.get(), 0);
        assert_eq!(*control.starts.borrow(), vec!["fancontrol", "miner"]);
        assert!(control.is_running("miner"));
        assert!(control.is_running("fancontrol"));
        assert!(dir.join("logs").join("2026-10-19 07-04.txt").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn secondary_that_was_not_running_is_not_started() {
        let dir = temp_dir("recover-no-secondary");
        let config = test_config(&dir, restart_policy(true));
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let control = FakeControl::with_running(&["miner.exe"]);
        control.write_log_on_start("miner", &config.log_file, CLEAN_LOG);
        let supervisor = Supervisor::new(control);
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Restarted));
        assert_eq!(*supervisor.control().kills.borrow(), vec!["miner", "fancontrol"]);
        assert_eq!(*supervisor.control().starts.borrow(), vec!["miner"]);
        assert!(!supervisor.control().is_running("fancontrol"));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn hang_after_restart_escalates_to_reboot() {
        let dir = temp_dir("recover-escalate");
        let config = test_config(&dir, restart_policy(true));
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let control = FakeControl::with_running(&["miner.exe", "fancontrol.exe"]);
        control.write_log_on_start("miner", &config.log_file, HUNG_LOG);
        let supervisor = Supervisor::new(control);
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(outcome, RecoveryOutcome::RebootScheduled));
        let control = supervisor.control();
        assert_eq!(
            *control.kills.borrow(),
            vec!["miner", "fancontrol", "miner", "fancontrol"]
        );
        assert!(!control.is_running("miner"));
        assert!(!control.is_running("fancontrol"));
        assert!(!config.log_file.exists());
        assert_eq!(stats.total_recoveries, 1);
        assert_eq!(control.reboots.get(), 1);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn second_kill_failure_aborts_the_pass() {
        let dir = temp_dir("recover-second-kill");
        let config = test_config(&dir, restart_policy(false));
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let control = FakeControl::with_running(&["miner.exe"]);
        control.write_log_on_start("miner", &config.log_file, HUNG_LOG);
        control.fail_nth_kill("miner", 2);
        let supervisor = Supervisor::new(control);
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());
        let before = stats.clone();

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(
            outcome,
            RecoveryOutcome::Aborted(AbortReason::Kill(_))
        ));
        assert_eq!(stats, before);
        assert_eq!(supervisor.control().reboots.get(), 0);
        assert!(
            config.log_file.exists(),
            "fresh log must not be archived after a failed kill"
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_reboot_is_retried_until_accepted_and_counted_once() {
        let dir = temp_dir("recover-retry");
        let config = test_config(&dir, RecoveryPolicy::RebootOnly);
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        let control = FakeControl::with_running(&["miner.exe"]);
        control.fail_reboots(3);
        let supervisor = Supervisor::new(control);
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());

        let outcome = RecoveryOrchestrator::new(&config, &supervisor, &clock)
            .recover(&mut stats)
            .await;

        assert!(matches!(outcome, RecoveryOutcome::RebootScheduled));
        assert_eq!(supervisor.control().reboots.get(), 1);
        assert_eq!(stats.total_recoveries, 1);
        assert_eq!(
            load_stats(&config.stats_file)
                .expect("stats should be persisted")
                .total_recoveries,
            1
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_waits_until_the_recovery_is_persisted() {
        let dir = temp_dir("recover-persist-retry");
        let mut config = test_config(&dir, RecoveryPolicy::RebootOnly);
        fs::write(&config.log_file, HUNG_LOG).expect("failed to write log");
        // A regular file where the stats directory should be makes every save fail.
        let blocker = dir.join("blocker");
        fs::write(&blocker, "").expect("failed to write blocker");
        config.stats_file = blocker.join("stats.txt");
        config.reboot_retry = Duration::from_secs(5);

        let supervisor = Supervisor::new(FakeControl::with_running(&["miner.exe"]));
        let clock = ManualClock::new(at(19, 7, 4));
        let mut stats = WatchdogStats::new(at(19, 0, 0).date());
        let orchestrator = RecoveryOrchestrator::new(&config, &supervisor, &clock);

        let unblock = async {
            // Several save attempts fail in the meantime.
            tokio::time::sleep(Duration::from_secs(17)).await;
            assert_eq!(supervisor.control().reboots.get(), 0);
            assert!(!config.stats_file.exists());
            fs::remove_file(&blocker).expect("failed to remove blocker");
        };
        let (outcome, ()) = tokio::join!(orchestrator.recover(&mut stats), unblock);

        assert!(matches!(outcome, RecoveryOutcome::RebootScheduled));
        assert_eq!(supervisor.control().reboots.get(), 1);
        assert_eq!(stats.total_recoveries, 1);
        let persisted = load_stats(&config.stats_file).expect("stats should be persisted");
        assert_eq!(persisted.total_recoveries, 1);
        assert_eq!(persisted.today_recoveries, 1);

        let _ = fs::remove_dir_all(dir);
    }
}
