use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::errors::ArchiveFailed;

const ARCHIVE_DIR_NAME: &str = "logs";
const ARCHIVE_NAME_FORMAT: &str = "%Y-%m-%d %H-%M.txt";

/// A log file that was copied into the archive directory and removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archived {
    pub archive: PathBuf,
    pub bytes: u64,
}

/// Reads the whole miner log as lines. Invalid UTF-8 is replaced rather than rejected.
pub fn read_log_lines(path: &Path) -> io::Result<Vec<String>> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Directory that receives archived logs: `logs/` next to the log file.
pub fn archive_dir(log_file: &Path) -> PathBuf {
    match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(ARCHIVE_DIR_NAME),
        _ => PathBuf::from(ARCHIVE_DIR_NAME),
    }
}

/// Archive name for a log moved at `now`; minute resolution, so a second
/// archive within the same minute replaces the first.
pub fn archive_path(log_file: &Path, now: NaiveDateTime) -> PathBuf {
    archive_dir(log_file).join(now.format(ARCHIVE_NAME_FORMAT).to_string())
}

/// Copies `log_file` into the archive directory, then deletes the original.
///
/// Any failure aborts the move. The original is only deleted once the copy is
/// complete, so a failed archive never loses the log.
pub fn archive_log(log_file: &Path, now: NaiveDateTime) -> Result<Archived, ArchiveFailed> {
    let failed = |step: &str, err: io::Error| ArchiveFailed {
        path: log_file.to_path_buf(),
        reason: format!("{step}: {err}"),
    };

    let dir = archive_dir(log_file);
    if !dir.is_dir() {
        fs::create_dir_all(&dir)
            .map_err(|err| failed(&format!("create {}", dir.display()), err))?;
    }

    let archive = archive_path(log_file, now);
    let bytes = fs::copy(log_file, &archive)
        .map_err(|err| failed(&format!("copy to {}", archive.display()), err))?;
    fs::remove_file(log_file).map_err(|err| failed("remove original", err))?;

    Ok(Archived { archive, bytes })
}
