//! Decoupled log capture for kext operations.
//!
//! `LogCollector` implements the `log` crate's `Log` trait. Every record is
//! stamped and pushed through an unbounded crossbeam channel, so logging
//! never blocks and embedders (or tests) can drain the lines afterwards.
//! Lines can also be appended to a log file.
//!
//! # Architecture
//!
//! ```text
//! log::info!() / KextCallbacks::log
//!     |
//! [LogCollector]
//!     | (unbounded channel)
//!     +--> drain() / receiver()
//!     +--> optional log file
//! ```

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One captured log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    /// Log target; user-facing kext messages use `"kext"`.
    pub target: String,
    pub message: String,
    /// Local time the record was captured.
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        LogLine {
            level,
            target: target.into(),
            message: message.into(),
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    /// Line as written to a log file: `[HH:MM:SS.mmm] [LEVEL] message`.
    pub fn formatted(&self) -> String {
        format!("[{}] [{}] {}", self.timestamp, self.level, self.message)
    }
}

/// Logger that captures records into a channel.
pub struct LogCollector {
    tx: Sender<LogLine>,
    rx: Receiver<LogLine>,
    level: LevelFilter,
    file: Option<Arc<Mutex<File>>>,
    file_path: Option<PathBuf>,
}

impl LogCollector {
    pub fn new(level: LevelFilter) -> Self {
        let (tx, rx) = unbounded::<LogLine>();
        LogCollector {
            tx,
            rx,
            level,
            file: None,
            file_path: None,
        }
    }

    /// Also append every line to `path`, creating parent directories.
    pub fn with_log_file(mut self, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(Arc::new(Mutex::new(file)));
        self.file_path = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Capture a line (non-blocking).
    pub fn push(&self, line: LogLine) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{}", line.formatted());
            }
        }
        let _ = self.tx.send(line);
    }

    /// Take every line captured so far.
    pub fn drain(&self) -> Vec<LogLine> {
        self.rx.try_iter().collect()
    }

    /// Receiver for consumers that want to wait on lines.
    pub fn receiver(&self) -> Receiver<LogLine> {
        self.rx.clone()
    }
}

/// Wires all log::info!(), log::warn!(), log::error!() calls into LogCollector
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.push(LogLine::new(
                record.level(),
                record.target(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

static GLOBAL_COLLECTOR: OnceCell<LogCollector> = OnceCell::new();

/// Install a global `LogCollector` at `level`.
///
/// Only the first call installs a logger; later calls return the collector
/// already installed. Fails only if another logger was installed first.
pub fn initialize_logging(level: LevelFilter) -> Result<&'static LogCollector, log::SetLoggerError> {
    if let Some(collector) = GLOBAL_COLLECTOR.get() {
        return Ok(collector);
    }
    let collector = GLOBAL_COLLECTOR.get_or_init(|| LogCollector::new(level));
    log::set_logger(collector)?;
    log::set_max_level(level);
    Ok(collector)
}

/// The collector installed by [`initialize_logging`], if any.
pub fn global_collector() -> Option<&'static LogCollector> {
    GLOBAL_COLLECTOR.get()
}
