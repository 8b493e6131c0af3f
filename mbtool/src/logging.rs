// src/logging.rs

//! Process-wide logger.
//!
//! Records always go to the platform sink (logcat on Android, stderr
//! elsewhere). Once the daemon has opened its log file, they are also
//! appended there. The file descriptor is inherited across `fork()`, so
//! per-connection processes keep writing to the same file.

use anyhow::{Context, Result};
use log::{Level, Log, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use crate::constants;

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

struct DaemonLogger {
    #[cfg(target_os = "android")]
    platform: android_logger::AndroidLogger,
}

impl DaemonLogger {
    #[cfg(target_os = "android")]
    fn new(tag: &str) -> Self {
        Self {
            platform: android_logger::AndroidLogger::new(
                android_logger::Config::default()
                    .with_max_level(constants::MAX_LOG_LEVEL)
                    .with_tag(tag),
            ),
        }
    }

    #[cfg(not(target_os = "android"))]
    fn new(_tag: &str) -> Self {
        Self {}
    }

    #[cfg(target_os = "android")]
    fn log_platform(&self, record: &Record) {
        self.platform.log(record);
    }

    #[cfg(not(target_os = "android"))]
    fn log_platform(&self, record: &Record) {
        eprintln!("{}", format_record(record));
    }
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= constants::MAX_LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        self.log_platform(record);

        if let Some(file) = LOG_FILE.get() {
            // One write per line; connection processes share the file.
            let line = file_line(record);
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Some(file) = LOG_FILE.get() {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = file.flush();
        }
    }
}

fn format_record(record: &Record) -> String {
    format!(
        "{} {} {}",
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
        level_tag(record.level()),
        record.args()
    )
}

fn file_line(record: &Record) -> String {
    let mut line = format_record(record);
    line.push('\n');
    line
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "V",
    }
}

/// Installs the process-wide logger with a specific tag.
pub fn init(tag: &str) {
    if log::set_boxed_logger(Box::new(DaemonLogger::new(tag))).is_ok() {
        log::set_max_level(constants::MAX_LOG_LEVEL);
    }
}

/// Truncates the log file at `path` and starts mirroring records into it.
///
/// The parent directory is created if needed.
pub fn open_log_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(parent)
            .with_context(|| format!("Failed to create parent directory of {}", path.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    file.set_len(0)
        .with_context(|| format!("Failed to truncate log file {}", path.display()))?;

    if LOG_FILE.set(Mutex::new(file)).is_err() {
        anyhow::bail!("Log file is already open");
    }
    Ok(())
}
