use std::future::Future;
use std::io;
use std::time::Instant;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::analyzer::{detect, HangVerdict};
use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::logging::read_log_lines;
use crate::recovery::{AbortReason, RecoveryOrchestrator, RecoveryOutcome};
use crate::stats::{format_session, format_uptime, save_stats, WatchdogStats};
use crate::supervisor::{ProcessControl, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// A reboot is scheduled; the loop must stop.
    Rebooting,
}

pub struct WatchdogLoop<C, K> {
    config: WatchdogConfig,
    supervisor: Supervisor<C>,
    clock: K,
    stats: WatchdogStats,
    iteration: u64,
    started: Instant,
    last_tick: Instant,
}

impl<C: ProcessControl, K: Clock> WatchdogLoop<C, K> {
    pub fn new(config: WatchdogConfig, control: C, clock: K, stats: WatchdogStats) -> Self {
        let now = Instant::now();
        Self {
            config,
            supervisor: Supervisor::new(control),
            clock,
            stats,
            iteration: 0,
            started: now,
            last_tick: now,
        }
    }

    /// Polls until a recovery schedules a reboot, or until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Polls until a recovery schedules a reboot, or until `shutdown` resolves.
    /// `shutdown` is held across iterations, so a signal raised mid-tick is
    /// seen at the next sleep.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        info!(
            "watching {} every {}s (policy: {})",
            self.config.log_file.display(),
            self.config.poll_interval.as_secs(),
            self.config.policy
        );
        let mut wake = wake_signal()?;
        tokio::pin!(shutdown);

        loop {
            if self.tick().await == TickOutcome::Rebooting {
                info!("watchdog exiting; the machine is about to reboot");
                return Ok(());
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = wait_for_wake(&mut wake) => {
                    warn!("sleep interrupted; polling now");
                }
                ctrl = &mut shutdown => {
                    if let Err(err) = ctrl {
                        warn!("failed to wait for shutdown signal: {err}");
                    }
                    info!("received shutdown signal; saving stats");
                    self.persist();
                    return Ok(());
                }
            }
        }
    }

    /// One poll: account uptime, report, persist, then check the log.
    pub async fn tick(&mut self) -> TickOutcome {
        let consumed = self.stats.advance_uptime(self.last_tick.elapsed());
        self.last_tick += consumed;
        let today = self.clock.today();
        if self.stats.roll_over(today) {
            info!("new day {today}; daily recovery counter reset");
        }

        let iteration = self.iteration;
        self.iteration += 1;
        if iteration % u64::from(self.config.report_every) == 0 {
            self.report();
        }
        if iteration > 0 && iteration % u64::from(self.config.persist_every) == 0 {
            self.persist();
        }

        let verdict = match read_log_lines(&self.config.log_file) {
            Ok(lines) => detect(&lines, &self.config.markers),
            Err(err) => {
                warn!(
                    "could not read {}: {err}",
                    self.config.log_file.display()
                );
                HangVerdict::NoHang
            }
        };

        let HangVerdict::Hang(reason) = verdict else {
            info!("miner hang not detected");
            return TickOutcome::Continue;
        };

        warn!("miner hang detected ({reason})");
        let outcome = RecoveryOrchestrator::new(&self.config, &self.supervisor, &self.clock)
            .recover(&mut self.stats)
            .await;
        match outcome {
            RecoveryOutcome::RebootScheduled => TickOutcome::Rebooting,
            RecoveryOutcome::Restarted => TickOutcome::Continue,
            RecoveryOutcome::Aborted(AbortReason::Kill(err)) => {
                warn!("recovery aborted, will retry next poll: {err}");
                TickOutcome::Continue
            }
            RecoveryOutcome::Aborted(AbortReason::Archive(err)) => {
                warn!("recovery aborted, will retry next poll: {err}");
                TickOutcome::Continue
            }
        }
    }

    fn report(&self) {
        info!(
            "session {} | total uptime {} | recoveries today {} total {} | last recovery {}",
            format_session(self.started.elapsed()),
            format_uptime(self.stats.total_uptime),
            self.stats.today_recoveries,
            self.stats.total_recoveries,
            self.stats.last_recovery_label()
        );
    }

    fn persist(&mut self) {
        self.stats.roll_over(self.clock.today());
        if let Err(err) = save_stats(&self.config.stats_file, &self.stats) {
            warn!("failed to persist stats, will retry next cycle: {err:#}");
        }
    }
}

#[cfg(unix)]
type WakeSignal = tokio::signal::unix::Signal;

/// SIGUSR1 cuts the current sleep short.
#[cfg(unix)]
fn wake_signal() -> Result<WakeSignal> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")
}

#[cfg(unix)]
async fn wait_for_wake(wake: &mut WakeSignal) {
    if wake.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
struct WakeSignal;

#[cfg(not(unix))]
fn wake_signal() -> Result<WakeSignal> {
    Ok(WakeSignal)
}

#[cfg(not(unix))]
async fn wait_for_wake(_wake: &mut WakeSignal) {
    std::future::pending::<()>().await;
}
