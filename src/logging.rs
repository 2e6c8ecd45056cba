//! Log sinks for the service: console and a size-rotated file, plus the
//! retention and inspection helpers used by `plotrun-logs`.

use crate::config::ServiceConfig;
use crate::errors::{ExecError, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{info, warn, Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Timestamp layout of every log line
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// `2024-05-01 12:00:00,123 - INFO - message key=value`
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format(TIMESTAMP_FORMAT),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct RotatingState {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    backups: usize,
}

impl RotatingState {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0
            && self.written > 0
            && self.written + buf.len() as u64 >= self.max_bytes
        {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    /// `api.log` becomes `api.log.1`, `api.log.1` becomes `api.log.2`, ...
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups > 0 {
            for idx in (1..self.backups).rev() {
                let from = backup_path(&self.path, idx);
                if from.exists() {
                    fs::rename(&from, backup_path(&self.path, idx + 1))?;
                }
            }
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

/// Size-rotated log file shared by every writer handed out to the subscriber
#[derive(Clone)]
pub struct RotatingFile {
    state: Arc<Mutex<RotatingState>>,
    path: PathBuf,
}

impl RotatingFile {
    /// Open (appending) or create the file, creating its directory if needed
    ///
    /// `max_bytes == 0` disables rotation. With `backups == 0` the file is
    /// truncated instead of rotated.
    pub fn open(path: impl AsRef<Path>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState {
                path: path.clone(),
                file,
                written,
                max_bytes,
                backups,
            })),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        state.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        state.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Path of the `idx`-th backup of a log file
pub fn backup_path(path: &Path, idx: usize) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(format!(".{}", idx));
    PathBuf::from(name)
}

/// Install the global subscriber: console plus rotating file
///
/// The level comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging(config: &ServiceConfig) -> Result<RotatingFile> {
    let file = RotatingFile::open(
        &config.log_file,
        config.log_max_bytes,
        config.log_backup_count,
    )?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let level = filter.to_string();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(file.clone()),
        )
        .try_init()
        .map_err(|e| ExecError::InternalError(format!("failed to install subscriber: {}", e)))?;

    info!("Logging initialized");
    info!("Log file: {}", file.path().display());
    info!("Log level: {}", level);
    info!(
        "Max file size: {:.1} MB",
        config.log_max_bytes as f64 / (1024.0 * 1024.0)
    );
    info!("Backup count: {}", config.log_backup_count);

    Ok(file)
}

fn is_log_file(name: &str) -> bool {
    name.ends_with(".log") || name.contains(".log.")
}

/// Delete `*.log` and `*.log.*` files in `dir` last modified more than `days` ago
///
/// Returns the removed paths. Files that cannot be removed are logged and skipped.
pub fn cleanup_old_logs(dir: &Path, days: u64) -> Result<Vec<PathBuf>> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = entry
            .file_name()
            .to_str()
            .map(is_log_file)
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = match metadata.modified() {
            Ok(t) => t,
            Err(e) => {
                warn!("Cannot read modification time of {:?}: {}", path, e);
                continue;
            }
        };

        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }

    removed.sort();
    Ok(removed)
}

/// Size and modification time of a log file
#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub size_kb: f64,
    pub size_mb: f64,
    pub modified: DateTime<Local>,
}

/// Inspect a log file; `None` when it does not exist
pub fn log_file_info(path: &Path) -> Result<Option<LogFileInfo>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let size_bytes = metadata.len();
    let size_kb = size_bytes as f64 / 1024.0;

    Ok(Some(LogFileInfo {
        path: path.to_path_buf(),
        size_bytes,
        size_kb,
        size_mb: size_kb / 1024.0,
        modified: DateTime::<Local>::from(metadata.modified()?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn test_rotation_keeps_backup_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        let mut file = RotatingFile::open(&path, 20, 2).unwrap();

        for line in ["first line 0001\n", "second line 002\n", "third line 0003\n", "fourth line 004\n"] {
            file.write_all(line.as_bytes()).unwrap();
        }

        assert_eq!(fs::read_to_string(&path).unwrap(), "fourth line 004\n");
        assert_eq!(
            fs::read_to_string(backup_path(&path, 1)).unwrap(),
            "third line 0003\n"
        );
        assert_eq!(
            fs::read_to_string(backup_path(&path, 2)).unwrap(),
            "second line 002\n"
        );
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn test_zero_backups_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        let mut file = RotatingFile::open(&path, 10, 0).unwrap();
        file.write_all(b"aaaaaaaa\n").unwrap();
        file.write_all(b"bbbbbbbb\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbbbbbb\n");
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("api.log");
        RotatingFile::open(&path, 0, 5)
            .unwrap()
            .write_all(b"one\n")
            .unwrap();
        RotatingFile::open(&path, 0, 5)
            .unwrap()
            .write_all(b"two\n")
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_rotated_file_keeps_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        let mut file = RotatingFile::open(&path, 8, 1).unwrap();
        file.write_all(b"aaaaaaaa\n").unwrap();
        file.write_all(b"bbbbbbbb\n").unwrap();
        assert_eq!(file.path(), path.as_path());
        assert!(backup_path(file.path(), 1).exists());
    }

    #[test]
    fn test_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        let file = RotatingFile::open(&path, 0, 1).unwrap();

        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(file),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(request_id = 7, "Request started");
            tracing::warn!("careful");
        });

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let (stamp, rest) = lines[0].split_at(23);
        assert_eq!(&stamp[19..20], ",");
        assert!(NaiveDateTime::parse_from_str(&stamp[..19], "%Y-%m-%d %H:%M:%S").is_ok());
        assert!(rest.starts_with(" - INFO - Request started"));
        assert!(rest.contains("request_id=7"));
        assert!(lines[1].contains(" - WARN - careful"));
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = SystemTime::now() - Duration::from_secs(40 * 24 * 60 * 60);

        for name in ["api.log", "api.log.1", "notes.txt"] {
            let path = dir.path().join(name);
            fs::write(&path, "x").unwrap();
            File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(old)
                .unwrap();
        }
        fs::write(dir.path().join("fresh.log"), "x").unwrap();

        let removed = cleanup_old_logs(dir.path(), 30).unwrap();
        assert_eq!(
            removed,
            vec![dir.path().join("api.log"), dir.path().join("api.log.1")]
        );
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("fresh.log").exists());
    }

    #[test]
    fn test_log_file_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        assert!(log_file_info(&path).unwrap().is_none());

        fs::write(&path, vec![b'a'; 2048]).unwrap();
        let info = log_file_info(&path).unwrap().unwrap();
        assert_eq!(info.size_bytes, 2048);
        assert!((info.size_kb - 2.0).abs() < f64::EPSILON);
    }
}
