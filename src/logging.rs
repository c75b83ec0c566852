use std::sync::OnceLock;

use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

static LOGGER: OnceLock<ForwardingLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

impl LogMessage {
    fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

/// env_logger output to stderr, optionally mirrored to a channel.
/// The active level is `log`'s max level, so it can change after install.
pub struct ForwardingLogger {
    inner: env_logger::Logger,
    forward: Option<UnboundedSender<LogMessage>>,
    env_override: bool,
}

impl ForwardingLogger {
    pub fn new(forward: Option<UnboundedSender<LogMessage>>) -> Self {
        let inner = env_logger::Builder::new()
            .filter_level(LevelFilter::Trace)
            .parse_default_env()
            .build();
        Self {
            inner,
            forward,
            env_override: std::env::var_os("RUST_LOG").is_some(),
        }
    }

    pub fn init(
        level: LevelFilter,
        forward: Option<UnboundedSender<LogMessage>>,
    ) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| ForwardingLogger::new(forward));
        log::set_logger(logger).map(|()| Self::set_level(level))
    }

    /// Changes the level of the installed logger. `RUST_LOG` wins when set.
    pub fn set_level(level: LevelFilter) {
        match LOGGER.get() {
            Some(logger) if logger.env_override => log::set_max_level(logger.inner.filter()),
            _ => log::set_max_level(level),
        }
    }

    fn emit_log(&self, record: &Record) {
        if let Some(forward) = &self.forward {
            // Receiver gone means nobody is listening any more
            let _ = forward.send(LogMessage::from_record(record));
        }
    }
}

impl log::Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.inner.matches(record) {
            self.inner.log(record);
            self.emit_log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}
