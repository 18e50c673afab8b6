//! Configuration module for the lottery server.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI arguments and environment variables take
//! precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the lottery server
#[derive(Parser, Debug, Default)]
#[command(name = "lottery-server")]
#[command(version = "0.1.0")]
#[command(about = "Collects agency bets and runs the lottery draw", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, env = "SERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long, env = "SERVER_HOST")]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Accept backlog of the listening socket
    #[arg(short, long, env = "SERVER_LISTEN_BACKLOG")]
    pub backlog: Option<i32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, env = "SERVER_WORKERS")]
    pub workers: Option<usize>,

    /// Number of agencies that must request the draw before it happens
    #[arg(short, long, env = "LOTTERY_AGENCIES")]
    pub agencies: Option<usize>,

    /// Seconds a draw request waits for the remaining agencies
    #[arg(long, env = "LOTTERY_BARRIER_TIMEOUT")]
    pub barrier_timeout: Option<u64>,

    /// CSV file where bets are persisted
    #[arg(long, env = "STORAGE_BETS_PATH")]
    pub bets_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOGGING_LEVEL")]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lottery: LotteryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest frame accepted before the delimiter shows up
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            listen_backlog: default_listen_backlog(),
            workers: None,
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Draw-related configuration
#[derive(Debug, Deserialize)]
pub struct LotteryConfig {
    #[serde(default = "default_agencies")]
    pub agencies: usize,
    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout_secs: u64,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            agencies: default_agencies(),
            barrier_timeout_secs: default_barrier_timeout(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_bets_path")]
    pub bets_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bets_path: default_bets_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_listen_backlog() -> i32 {
    5
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_agencies() -> usize {
    5
}

fn default_barrier_timeout() -> u64 {
    5
}

fn default_bets_path() -> PathBuf {
    PathBuf::from("bets.csv")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub listen_backlog: i32,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub agencies: usize,
    pub barrier_timeout: Duration,
    pub bets_path: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args, environment and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge already-parsed CLI args with the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            listen_backlog: cli.backlog.unwrap_or(toml_config.server.listen_backlog),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            max_frame_size: toml_config.server.max_frame_size,
            agencies: cli.agencies.unwrap_or(toml_config.lottery.agencies),
            barrier_timeout: Duration::from_secs(
                cli.barrier_timeout
                    .unwrap_or(toml_config.lottery.barrier_timeout_secs),
            ),
            bets_path: cli.bets_path.unwrap_or(toml_config.storage.bets_path),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agencies == 0 {
            return Err(ConfigError::Invalid("lottery.agencies must be at least 1"));
        }
        if self.listen_backlog < 1 {
            return Err(ConfigError::Invalid("server.listen_backlog must be at least 1"));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("server.max_frame_size must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be at least 1"));
        }
        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = format!("{}:{}", self.host, self.port);
        listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(listen))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
impl Config {
    /// Loopback configuration with an ephemeral port, for tests.
    pub fn for_tests(agencies: usize) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            listen_backlog: 16,
            workers: None,
            max_connections: 64,
            max_frame_size: default_max_frame_size(),
            agencies,
            barrier_timeout: Duration::from_secs(5),
            bets_path: default_bets_path(),
            log_level: "debug".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.server.listen_backlog, 5);
        assert_eq!(config.lottery.agencies, 5);
        assert_eq!(config.lottery.barrier_timeout_secs, 5);
        assert_eq!(config.storage.bets_path, PathBuf::from("bets.csv"));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 4000
            listen_backlog = 10
            workers = 4

            [lottery]
            agencies = 3
            barrier_timeout_secs = 30

            [storage]
            bets_path = "/data/bets.csv"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.listen_backlog, 10);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.lottery.agencies, 3);
        assert_eq!(config.lottery.barrier_timeout_secs, 30);
        assert_eq!(config.storage.bets_path, PathBuf::from("/data/bets.csv"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliArgs {
            port: Some(9000),
            agencies: Some(2),
            barrier_timeout: Some(12),
            log_level: Some("warn".to_string()),
            ..CliArgs::default()
        };

        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.agencies, 2);
        assert_eq!(config.barrier_timeout, Duration::from_secs(12));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.listen_backlog, 5);
        assert_eq!(config.listen_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_zero_agencies_rejected() {
        let cli = CliArgs {
            agencies: Some(0),
            ..CliArgs::default()
        };

        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/lottery.toml")),
            ..CliArgs::default()
        };

        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
