//! A small `log::Log` implementation with a fixed, timestamped line
//! format, writing to stdout or to a file.
//!
//! This is the concrete sink behind every `info!`/`debug!`/`warn!`/
//! `error!` call made throughout the relay crates; it is the only
//! place in the codebase that knows about the on-disk log format.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Stdout, Write};
use std::sync::Mutex;

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::config::{LogLevel, LogSink, LoggingConfig};

/// Failure to install the global logger, either because the configured
/// log file could not be opened or because a logger was already set.
#[derive(Debug)]
pub enum LogError {
    Io(io::Error),
    AlreadySet(SetLoggerError),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogError::Io(e) => write!(f, "could not open log file: {}", e),
            LogError::AlreadySet(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Io(e) => Some(e),
            LogError::AlreadySet(e) => Some(e),
        }
    }
}

impl From<io::Error> for LogError {
    fn from(e: io::Error) -> Self {
        LogError::Io(e)
    }
}

impl From<SetLoggerError> for LogError {
    fn from(e: SetLoggerError) -> Self {
        LogError::AlreadySet(e)
    }
}

enum Sink {
    Stdout(Stdout),
    File(std::fs::File),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(s) => s.write(buf),
            Sink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(s) => s.flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

/// Thread-safe logger writing `[YYYY-MM-DD HH:MM:SS][LEVEL] message` lines.
pub struct SinkLogger {
    level: LevelFilter,
    sink: Mutex<Sink>,
}

impl SinkLogger {
    fn new(level: LevelFilter, sink: Sink) -> SinkLogger {
        SinkLogger {
            level,
            sink: Mutex::new(sink),
        }
    }
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "[{}][{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        );

        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(line.as_bytes());
            let _ = sink.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Error => LevelFilter::Error,
    }
}

/// Installs the global logger for the process, per the `logging`
/// section of the configuration. Must be called at most once.
pub fn init(config: &LoggingConfig) -> Result<(), LogError> {
    let filter = level_filter(config.level);

    let sink = match &config.sink {
        LogSink::Stdout => Sink::Stdout(io::stdout()),
        LogSink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Sink::File(file)
        }
    };

    let logger = SinkLogger::new(filter, sink);
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(filter);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogLevel, LogSink, LoggingConfig};

    #[test]
    fn level_filter_maps_config_levels() {
        assert_eq!(level_filter(LogLevel::Debug), LevelFilter::Debug);
        assert_eq!(level_filter(LogLevel::Error), LevelFilter::Error);
    }

    #[test]
    fn stdout_sink_writes_without_panic() {
        let cfg = LoggingConfig {
            level: LogLevel::Info,
            sink: LogSink::Stdout,
        };
        let filter = level_filter(cfg.level);
        let sink = Sink::Stdout(io::stdout());
        let logger = SinkLogger::new(filter, sink);
        logger.flush();
    }
}
