//! Read-only scanning of the service log: tailing, keyword and level filters,
//! time windows and request statistics. Backs both `GET /logs` and the
//! `plotrun-logs` tool.

use crate::errors::{ExecError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Message logged when a render request arrives
pub const REQUEST_STARTED: &str = "Request started";
/// Message logged when a render request produced an image
pub const REQUEST_COMPLETED: &str = "Request completed";

const RECENT_REQUESTS: usize = 5;

/// Levels the log tools filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    /// Separator-delimited level text as it appears in a log line
    pub fn marker(self) -> &'static str {
        match self {
            Level::Info => " - INFO - ",
            Level::Warning => " - WARN - ",
            Level::Error => " - ERROR - ",
        }
    }
}

/// A log line with its 1-based position in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub number: usize,
    pub text: String,
}

/// Read every line of a log file
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecError::LogFileNotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}

/// The last `limit` lines
pub fn tail(lines: &[String], limit: usize) -> &[String] {
    &lines[lines.len().saturating_sub(limit)..]
}

fn numbered<F>(lines: &[String], mut keep: F) -> Vec<LogLine>
where
    F: FnMut(&str) -> bool,
{
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| keep(line.as_str()))
        .map(|(idx, line)| LogLine {
            number: idx + 1,
            text: line.clone(),
        })
        .collect()
}

/// Lines containing `keyword`, ignoring case
pub fn search(lines: &[String], keyword: &str) -> Vec<LogLine> {
    let needle = keyword.to_lowercase();
    numbered(lines, |line| line.to_lowercase().contains(&needle))
}

/// Lines logged at exactly `level`
pub fn filter_level(lines: &[String], level: Level) -> Vec<LogLine> {
    numbered(lines, |line| line.contains(level.marker()))
}

/// Parse the leading `YYYY-MM-DD HH:MM:SS,mmm` timestamp of a log line
pub fn parse_timestamp(line: &str) -> Option<NaiveDateTime> {
    let stamp = line.split(" - ").next()?;
    let (secs, millis) = stamp.split_once(',').unwrap_or((stamp, "0"));
    let base = NaiveDateTime::parse_from_str(secs, "%Y-%m-%d %H:%M:%S").ok()?;
    let millis: u16 = millis.trim().parse().ok()?;
    if millis > 999 {
        return None;
    }
    base.checked_add_signed(TimeDelta::milliseconds(i64::from(millis)))
}

/// Lines stamped within `hours` of `now`; lines without a timestamp are skipped
pub fn filter_since(lines: &[String], hours: i64, now: NaiveDateTime) -> Result<Vec<LogLine>> {
    let threshold = TimeDelta::try_hours(hours)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| ExecError::InternalError(format!("time window of {} hours is out of range", hours)))?;
    Ok(numbered(lines, |line| {
        parse_timestamp(line).map_or(false, |stamp| stamp >= threshold)
    }))
}

/// Counters derived from a log file
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogStats {
    pub total_lines: usize,
    pub info: usize,
    pub warning: usize,
    pub error: usize,
    pub requests: usize,
    pub completed: usize,
    /// Percentage of started requests that completed, 0 with no requests
    pub success_rate: f64,
    /// Timestamps of the most recent requests, newest first
    pub recent_requests: Vec<String>,
}

pub fn stats(lines: &[String]) -> LogStats {
    let mut stats = LogStats {
        total_lines: lines.len(),
        ..Default::default()
    };

    for line in lines {
        if line.contains(Level::Info.marker()) {
            stats.info += 1;
        } else if line.contains(Level::Warning.marker()) {
            stats.warning += 1;
        } else if line.contains(Level::Error.marker()) {
            stats.error += 1;
        }

        if line.contains(REQUEST_STARTED) {
            stats.requests += 1;
        }
        if line.contains(REQUEST_COMPLETED) {
            stats.completed += 1;
        }
    }

    if stats.requests > 0 {
        stats.success_rate = stats.completed as f64 / stats.requests as f64 * 100.0;
    }

    stats.recent_requests = lines
        .iter()
        .rev()
        .filter(|line| line.contains(REQUEST_STARTED))
        .filter_map(|line| line.split(" - ").next())
        .take(RECENT_REQUESTS)
        .map(str::to_string)
        .collect();

    stats
}

/// Move the log aside as `<stem>_backup_<unix>.log` and start a fresh file
///
/// Returns the backup path, or `None` when there was no log to clear.
pub fn clear(path: &Path, now: DateTime<Local>) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("api");
    let backup = path.with_file_name(format!("{}_backup_{}.log", stem, now.timestamp()));

    fs::rename(path, &backup)?;
    fs::write(
        path,
        format!("# Log file created: {}\n", now.format("%Y-%m-%d %H:%M:%S")),
    )?;

    Ok(Some(backup))
}

/// Follows a growing log file by byte offset
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
}

impl LogFollower {
    /// Start following from the current end of the file
    pub fn new(path: &Path) -> Result<Self> {
        let offset = match fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecError::LogFileNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            offset,
        })
    }

    /// Text appended since the last poll, if any
    ///
    /// A file that shrank (rotated or cleared) is read again from the start.
    pub fn poll(&mut self) -> Result<Option<String>> {
        let len = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len < self.offset {
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(None);
        }

        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;

        let text = String::from_utf8_lossy(&buf);
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}
