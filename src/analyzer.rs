//! Hang detection over a snapshot of the miner log.
//!
//! The miner reports two failure signatures: a GPU that stopped responding
//! outright, and a GPU thread that was restarted and then died with error 46.
//! The second only counts when the thread error comes *after* the restart
//! attempt; a trailing restart attempt on its own may still recover.

use serde::Deserialize;

/// Exact log lines that identify a hung GPU, compared case-insensitively.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MarkerSet {
    pub gpu0_not_responding: String,
    pub gpu1_not_responding: String,
    pub gpu0_restart_attempt: String,
    pub gpu1_restart_attempt: String,
    pub gpu0_thread_exited_46: String,
    pub gpu1_thread_exited_46: String,
}

impl MarkerSet {
    fn is_not_responding(&self, line: &str) -> bool {
        eq_ignore_case(line, &self.gpu0_not_responding)
            || eq_ignore_case(line, &self.gpu1_not_responding)
    }

    fn is_restart_attempt(&self, line: &str) -> bool {
        eq_ignore_case(line, &self.gpu0_restart_attempt)
            || eq_ignore_case(line, &self.gpu1_restart_attempt)
    }

    fn is_thread_exited(&self, line: &str) -> bool {
        eq_ignore_case(line, &self.gpu0_thread_exited_46)
            || eq_ignore_case(line, &self.gpu1_thread_exited_46)
    }

    pub fn entries(&self) -> [(&'static str, &str); 6] {
        [
            ("gpu0_not_responding", &self.gpu0_not_responding),
            ("gpu1_not_responding", &self.gpu1_not_responding),
            ("gpu0_restart_attempt", &self.gpu0_restart_attempt),
            ("gpu1_restart_attempt", &self.gpu1_restart_attempt),
            ("gpu0_thread_exited_46", &self.gpu0_thread_exited_46),
            ("gpu1_thread_exited_46", &self.gpu1_thread_exited_46),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangReason {
    /// A "not responding" marker line.
    Immediate,
    /// A restart attempt followed later by a thread-exited-46 line.
    Correlated,
}

impl std::fmt::Display for HangReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            HangReason::Immediate => "immediate",
            HangReason::Correlated => "correlated",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangVerdict {
    NoHang,
    Hang(HangReason),
}

impl std::fmt::Display for HangVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HangVerdict::NoHang => write!(f, "no hang"),
            HangVerdict::Hang(reason) => write!(f, "hang ({reason})"),
        }
    }
}

/// Scans `lines` in order and reports the first hang signature found.
///
/// An empty snapshot, or one whose first line is empty, means the miner has
/// not written its log yet and is never a hang.
pub fn detect<S: AsRef<str>>(lines: &[S], markers: &MarkerSet) -> HangVerdict {
    match lines.first() {
        None => return HangVerdict::NoHang,
        Some(first) if first.as_ref().is_empty() => return HangVerdict::NoHang,
        Some(_) => {}
    }

    // A restart attempt at `i` is correlated iff some thread error sits after it.
    let last_thread_exit = lines
        .iter()
        .rposition(|line| markers.is_thread_exited(line.as_ref()));

    for (idx, line) in lines.iter().enumerate() {
        let line = line.as_ref();
        if markers.is_not_responding(line) {
            return HangVerdict::Hang(HangReason::Immediate);
        }
        if markers.is_restart_attempt(line) && last_thread_exit.is_some_and(|last| last > idx) {
            return HangVerdict::Hang(HangReason::Correlated);
        }
    }

    HangVerdict::NoHang
}

fn eq_ignore_case(left: &str, right: &str) -> bool {
    left.chars()
        .flat_map(char::to_lowercase)
        .eq(right.chars().flat_map(char::to_lowercase))
}

#[cfg(test)]
pub(crate) fn fixture_markers() -> MarkerSet {
    MarkerSet {
        gpu0_not_responding: "GPU0 not responding".to_string(),
        gpu1_not_responding: "GPU1 not responding".to_string(),
        gpu0_restart_attempt: "Looks like GPU0 are stopped. Restart attempt.".to_string(),
        gpu1_restart_attempt: "Looks like GPU1 are stopped. Restart attempt.".to_string(),
        gpu0_thread_exited_46: "GPU0: Thread exited with error 46".to_string(),
        gpu1_thread_exited_46: "GPU1: Thread exited with error 46".to_string(),
    }
}
