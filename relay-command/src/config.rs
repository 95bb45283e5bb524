//! Configuration loading and validation.
//!
//! The JSON file on disk deserializes into [`RawConfig`], where every
//! field is optional and defaults are applied. [`Config::load`] turns
//! that into a fully validated [`Config`] or fails fast with a
//! [`ConfigError`] naming the first invariant it finds broken.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
struct RawEndpoint {
    host: Option<String>,
    port: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawListen {
    host: Option<String>,
    port: Option<u32>,
    backlog: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawLogging {
    level: Option<String>,
    mode: Option<String>,
    file_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawReactor {
    threads: Option<usize>,
    connection_read_buffer: Option<usize>,
    connection_write_buffer: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawShutdown {
    drain_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawConnectionPool {
    max_connections_per_backend: Option<usize>,
    connect_timeout_ms: Option<u64>,
    idle_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawConfig {
    listen: Option<RawListen>,
    backends: Option<Vec<RawEndpoint>>,
    logging: Option<RawLogging>,
    reactor: Option<RawReactor>,
    shutdown: Option<RawShutdown>,
    connection_pool: Option<RawConnectionPool>,
}

/// A validated listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
}

/// A validated backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub sink: LogSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    pub threads: usize,
    pub connection_read_buffer: usize,
    pub connection_write_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub drain_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoolConfig {
    pub max_connections_per_backend: usize,
    pub connect_timeout_ms: u64,
    pub idle_ttl_seconds: u64,
}

/// Fully validated, immutable configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: ListenConfig,
    pub backends: Vec<EndpointConfig>,
    pub logging: LoggingConfig,
    pub reactor: ReactorConfig,
    pub shutdown: ShutdownConfig,
    pub connection_pool: ConnectionPoolConfig,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    InvalidPort { field: &'static str, port: u32 },
    EmptyHost { field: &'static str },
    EmptyBackends,
    MissingFilePath,
    InvalidLevel(String),
    InvalidMode(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read config file: {}", e),
            ConfigError::Json(e) => write!(f, "invalid config JSON: {}", e),
            ConfigError::InvalidPort { field, port } => {
                write!(f, "{}: port {} is not in 1..=65535", field, port)
            }
            ConfigError::EmptyHost { field } => write!(f, "{}: host must not be empty", field),
            ConfigError::EmptyBackends => write!(f, "backends: at least one backend is required"),
            ConfigError::MissingFilePath => {
                write!(f, "logging.file_path is required when logging.mode is \"file\"")
            }
            ConfigError::InvalidLevel(l) => write!(f, "logging.level: unknown level {:?}", l),
            ConfigError::InvalidMode(m) => write!(f, "logging.mode: unknown mode {:?}", m),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

fn validate_port(field: &'static str, port: u32) -> Result<u16, ConfigError> {
    if port >= 1 && port <= 65535 {
        Ok(port as u16)
    } else {
        Err(ConfigError::InvalidPort { field, port })
    }
}

fn validate_host(field: &'static str, host: Option<String>) -> Result<String, ConfigError> {
    match host {
        Some(h) if !h.is_empty() => Ok(h),
        _ => Err(ConfigError::EmptyHost { field }),
    }
}

impl Config {
    /// Reads, parses and validates the configuration file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let raw: RawConfig = serde_json::from_str(&contents)?;
        Config::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Config, ConfigError> {
        let raw_listen = raw.listen.unwrap_or_default();
        let listen = ListenConfig {
            host: validate_host("listen.host", raw_listen.host)?,
            port: validate_port("listen.port", raw_listen.port.ok_or(
                ConfigError::InvalidPort { field: "listen.port", port: 0 },
            )?)?,
            backlog: raw_listen.backlog.unwrap_or(128),
        };

        let raw_backends = raw.backends.unwrap_or_default();
        if raw_backends.is_empty() {
            return Err(ConfigError::EmptyBackends);
        }
        let mut backends = Vec::with_capacity(raw_backends.len());
        for b in raw_backends {
            let port = validate_port(
                "backends[].port",
                b.port.ok_or(ConfigError::InvalidPort { field: "backends[].port", port: 0 })?,
            )?;
            let host = validate_host("backends[].host", b.host)?;
            backends.push(EndpointConfig { host, port });
        }

        let raw_logging = raw.logging.unwrap_or_default();
        let level = match raw_logging.level.as_deref().unwrap_or("info") {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            other => return Err(ConfigError::InvalidLevel(other.to_string())),
        };
        let sink = match raw_logging.mode.as_deref().unwrap_or("stdout") {
            "stdout" => LogSink::Stdout,
            "file" => {
                let path = raw_logging.file_path.ok_or(ConfigError::MissingFilePath)?;
                LogSink::File(path)
            }
            other => return Err(ConfigError::InvalidMode(other.to_string())),
        };
        let logging = LoggingConfig { level, sink };

        let raw_reactor = raw.reactor.unwrap_or_default();
        let reactor = ReactorConfig {
            threads: raw_reactor.threads.unwrap_or(0),
            connection_read_buffer: raw_reactor.connection_read_buffer.unwrap_or(8192),
            connection_write_buffer: raw_reactor.connection_write_buffer.unwrap_or(8192),
        };

        let raw_shutdown = raw.shutdown.unwrap_or_default();
        let shutdown = ShutdownConfig {
            drain_seconds: raw_shutdown.drain_seconds.unwrap_or(10),
        };

        let raw_pool = raw.connection_pool.unwrap_or_default();
        let connection_pool = ConnectionPoolConfig {
            max_connections_per_backend: raw_pool.max_connections_per_backend.unwrap_or(10),
            connect_timeout_ms: raw_pool.connect_timeout_ms.unwrap_or(3000),
            idle_ttl_seconds: raw_pool.idle_ttl_seconds.unwrap_or(300),
        };

        Ok(Config {
            listen,
            backends,
            logging,
            reactor,
            shutdown,
            connection_pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json).expect("valid json");
        Config::from_raw(raw)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(
            r#"{
                "listen": { "host": "127.0.0.1", "port": 8080 },
                "backends": [ { "host": "127.0.0.1", "port": 9001 } ]
            }"#,
        )
        .expect("should validate");

        assert_eq!(cfg.listen.backlog, 128);
        assert_eq!(cfg.connection_pool.max_connections_per_backend, 10);
        assert_eq!(cfg.connection_pool.connect_timeout_ms, 3000);
        assert_eq!(cfg.connection_pool.idle_ttl_seconds, 300);
        assert_eq!(cfg.shutdown.drain_seconds, 10);
        assert_eq!(cfg.logging.sink, LogSink::Stdout);
    }

    #[test]
    fn rejects_port_zero() {
        let err = parse(
            r#"{
                "listen": { "host": "127.0.0.1", "port": 0 },
                "backends": [ { "host": "127.0.0.1", "port": 9001 } ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn rejects_port_above_range() {
        let err = parse(
            r#"{
                "listen": { "host": "127.0.0.1", "port": 70000 },
                "backends": [ { "host": "127.0.0.1", "port": 9001 } ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn rejects_empty_backend_list() {
        let err = parse(
            r#"{
                "listen": { "host": "127.0.0.1", "port": 8080 },
                "backends": []
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBackends));
    }

    #[test]
    fn file_mode_requires_file_path() {
        let err = parse(
            r#"{
                "listen": { "host": "127.0.0.1", "port": 8080 },
                "backends": [ { "host": "127.0.0.1", "port": 9001 } ],
                "logging": { "mode": "file" }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingFilePath));
    }

    #[test]
    fn rejects_unknown_level() {
        let err = parse(
            r#"{
                "listen": { "host": "127.0.0.1", "port": 8080 },
                "backends": [ { "host": "127.0.0.1", "port": 9001 } ],
                "logging": { "level": "verbose" }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLevel(_)));
    }
}
