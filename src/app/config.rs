use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about = "Follows a slow-query log and emits aggregated query reports", long_about = None)]
pub struct Config {
    /// Path to the slow-query log file to follow
    #[arg(long, env = "SLOWLOG_FILE")]
    pub log_file: PathBuf,

    /// Prefix prepended to a relative log file path
    #[arg(long, env = "SLOWLOG_PATH_PREFIX")]
    pub path_prefix: Option<PathBuf>,

    /// Poll interval in milliseconds while waiting for new log data
    #[arg(long, env = "SLOWLOG_POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Interval between aggregated reports, in seconds
    #[arg(long, env = "SLOWLOG_REPORT_INTERVAL_SECS", default_value = "60")]
    pub report_interval_secs: u64,

    /// Capacity of the decoded-record channel (the backpressure point)
    #[arg(long, env = "SLOWLOG_CHANNEL_CAPACITY", default_value = "100")]
    pub channel_capacity: usize,

    /// Maximum stored length of an example query, in bytes
    #[arg(long, env = "SLOWLOG_MAX_QUERY_LENGTH", default_value = "2048")]
    pub max_query_length: usize,

    /// Log level
    #[arg(long, env = "SLOWLOG_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Write reports to this file instead of stdout
    #[arg(long, env = "SLOWLOG_REPORT_FILE")]
    pub report_file: Option<PathBuf>,

    /// Configuration file path (optional)
    #[arg(long, env = "SLOWLOG_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub poll_interval: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub report_interval: Duration,
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.post_process();
        config.validate()?;
        Ok(config)
    }

    /// Resolves the path prefix and converts interval fields to durations.
    pub fn post_process(&mut self) {
        if let Some(prefix) = &self.path_prefix {
            if self.log_file.is_relative() {
                self.log_file = prefix.join(&self.log_file);
            }
        }
        self.poll_interval = Duration::from_millis(self.poll_interval_ms);
        self.report_interval = Duration::from_secs(self.report_interval_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_file.as_os_str().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "log file path must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll interval must be at least 1ms".to_string(),
            ));
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "report interval must be at least 1s".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        if self.max_query_length < 16 {
            return Err(ConfigError::InvalidConfig(
                "max query length must be at least 16 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_from_args() {
        let config =
            Config::from_args(["slowlog-monitor", "--log-file", "/var/log/mongodb.log"]).unwrap();
        assert_eq!(config.log_file, PathBuf::from("/var/log/mongodb.log"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.report_interval, Duration::from_secs(60));
        assert_eq!(config.channel_capacity, 100);
        assert_eq!(config.max_query_length, 2048);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn path_prefix_resolves_relative_log_file() {
        let config = Config::from_args([
            "slowlog-monitor",
            "--log-file",
            "mongod.log",
            "--path-prefix",
            "/data/db",
        ])
        .unwrap();
        assert_eq!(config.log_file, PathBuf::from("/data/db/mongod.log"));
    }

    #[test]
    fn path_prefix_leaves_absolute_log_file_alone() {
        let config = Config::from_args([
            "slowlog-monitor",
            "--log-file",
            "/var/log/mongod.log",
            "--path-prefix",
            "/data/db",
        ])
        .unwrap();
        assert_eq!(config.log_file, PathBuf::from("/var/log/mongod.log"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let result = Config::from_args([
            "slowlog-monitor",
            "--log-file",
            "/var/log/mongod.log",
            "--poll-interval-ms",
            "0",
        ]);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
log_file = "mongod.log"
path_prefix = "/data/db"
poll_interval_ms = 250
report_interval_secs = 30
channel_capacity = 64
max_query_length = 512
log_level = "debug"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.log_file, PathBuf::from("/data/db/mongod.log"));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.report_interval, Duration::from_secs(30));
        assert_eq!(config.log_level, LogLevel::Debug);
    }
}
