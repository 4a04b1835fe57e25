//! Explicitly passed logging capability.
//!
//! Nothing in this crate logs through global state. Every component that
//! emits diagnostics receives a [`Logger`] handle and writes through it; the
//! default handle forwards to the `log` facade, tests hand in a
//! [`MemorySink`] and assert on what was captured.

use std::fmt;
use std::sync::{Arc, Mutex};

pub use log::Level;

const LOG_TARGET: &str = "spire_authz";

/// Destination for log records emitted through a [`Logger`].
pub trait LogSink: Send + Sync + 'static {
    /// Returns `false` to skip formatting records at `level`.
    fn enabled(&self, level: Level) -> bool {
        let _ = level;
        true
    }

    /// Writes one record.
    fn log(&self, level: Level, message: &str);
}

/// Cheap, cloneable handle to a [`LogSink`].
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    /// Wraps an arbitrary sink.
    pub fn new(sink: impl LogSink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Wraps an already shared sink, e.g. a [`MemorySink`] the caller keeps
    /// a reference to.
    pub fn from_shared(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Forwards records to the `log` crate under the `spire_authz` target.
    pub fn log_crate() -> Self {
        Self::new(LogCrateSink)
    }

    /// Drops every record.
    pub fn discard() -> Self {
        Self::new(DiscardSink)
    }

    #[doc(hidden)]
    pub fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.sink.enabled(level) {
            return;
        }
        match args.as_str() {
            Some(s) => self.sink.log(level, s),
            None => self.sink.log(level, &args.to_string()),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::log_crate()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Sink backed by the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn enabled(&self, level: Level) -> bool {
        log::log_enabled!(target: LOG_TARGET, level)
    }

    fn log(&self, level: Level, message: &str) {
        log::log!(target: LOG_TARGET, level, "{message}");
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl LogSink for DiscardSink {
    fn enabled(&self, _level: Level) -> bool {
        false
    }

    fn log(&self, _level: Level, _message: &str) {}
}

/// One captured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Formatted message.
    pub message: String,
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    /// Creates an empty shared sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything logged so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Records at exactly `level`.
    pub fn at(&self, level: Level) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .map(|r| r.message)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                level,
                message: message.to_owned(),
            });
        }
    }
}

impl LogSink for Arc<MemorySink> {
    fn log(&self, level: Level, message: &str) {
        self.as_ref().log(level, message);
    }
}

#[allow(unused_macros)]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.emit($crate::observability::Level::Debug, format_args!($($arg)*))
    };
}

#[allow(unused_macros)]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.emit($crate::observability::Level::Info, format_args!($($arg)*))
    };
}

#[allow(unused_macros)]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.emit($crate::observability::Level::Warn, format_args!($($arg)*))
    };
}

#[allow(unused_macros)]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.emit($crate::observability::Level::Error, format_args!($($arg)*))
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::{info, warn};

    #[test]
    fn memory_sink_captures_formatted_records() {
        let sink = MemorySink::new();
        let logger = Logger::new(Arc::clone(&sink));

        info!(logger, "opened source at {}", "unix:///tmp/agent.sock");
        warn!(logger, "allow-list unreadable");

        assert_eq!(
            sink.records(),
            vec![
                LogRecord {
                    level: Level::Info,
                    message: "opened source at unix:///tmp/agent.sock".to_owned(),
                },
                LogRecord {
                    level: Level::Warn,
                    message: "allow-list unreadable".to_owned(),
                },
            ]
        );
        assert_eq!(sink.at(Level::Warn), vec!["allow-list unreadable"]);
    }

    #[test]
    fn clones_share_the_sink() {
        let sink = MemorySink::new();
        let logger = Logger::new(Arc::clone(&sink));
        let clone = logger.clone();
        warn!(clone, "from clone");
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn discard_skips_everything() {
        let logger = Logger::discard();
        info!(logger, "nothing {}", 1);
    }
}
