//! Configuration module for completion-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// What a connection does once a read/response cycle is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionPolicy {
    /// Close the connection after the first read (and its reply, if any).
    Close,
    /// Keep reading until the peer disconnects.
    KeepAlive,
}

/// Built-in payload consumers selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumerKind {
    /// Log received bytes, send nothing back.
    Print,
    /// Send received bytes back to the peer.
    Echo,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "completion-server")]
#[command(author = "completion-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server driven by a shared completion queue", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads draining the completion queue
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-operation buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Submission queue entries of the completion ring
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Connection policy after a read/response cycle
    #[arg(long, value_enum)]
    pub policy: Option<ConnectionPolicy>,

    /// Payload consumer
    #[arg(long, value_enum)]
    pub consumer: Option<ConsumerKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and thread configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Completion ring and buffer configuration
#[derive(Debug, Deserialize)]
pub struct IoConfig {
    /// Per-operation buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Submission queue entries
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Consecutive wait failures tolerated before a worker gives up
    #[serde(default = "default_max_wait_failures")]
    pub max_wait_failures: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            ring_size: default_ring_size(),
            max_wait_failures: default_max_wait_failures(),
        }
    }
}

/// Per-connection behaviour
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_policy")]
    pub policy: ConnectionPolicy,
    #[serde(default = "default_consumer")]
    pub consumer: ConsumerKind,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            consumer: default_consumer(),
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// How long the coordinator waits for in-flight operations to drain
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
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

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    1024
}

fn default_ring_size() -> u32 {
    256
}

/// Largest submission queue the kernel will create.
pub const MAX_RING_SIZE: u32 = 32_768;

fn default_max_wait_failures() -> u32 {
    16
}

fn default_policy() -> ConnectionPolicy {
    ConnectionPolicy::Close
}

fn default_consumer() -> ConsumerKind {
    ConsumerKind::Print
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: usize,
    pub backlog: i32,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub ring_size: u32,
    pub max_wait_failures: u32,
    pub policy: ConnectionPolicy,
    pub consumer: ConsumerKind,
    pub drain_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let config = Config {
            listen,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.io.buffer_size),
            ring_size: cli.ring_size.unwrap_or(toml_config.io.ring_size),
            max_wait_failures: toml_config.io.max_wait_failures,
            policy: cli.policy.unwrap_or(toml_config.connection.policy),
            consumer: cli.consumer.unwrap_or(toml_config.connection.consumer),
            drain_timeout: Duration::from_millis(toml_config.shutdown.drain_timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Zero("buffer_size"));
        }
        if self.ring_size == 0 {
            return Err(ConfigError::Zero("ring_size"));
        }
        if self.ring_size > MAX_RING_SIZE {
            return Err(ConfigError::TooLarge("ring_size", MAX_RING_SIZE as u64));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        Ok(())
    }
}

#[cfg(test)]
impl CliArgs {
    fn default_args() -> Self {
        CliArgs {
            config: None,
            listen: None,
            workers: None,
            backlog: None,
            max_connections: None,
            buffer_size: None,
            ring_size: None,
            policy: None,
            consumer: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    Zero(&'static str),
    TooLarge(&'static str, u64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{}'", addr)
            }
            ConfigError::Zero(field) => write!(f, "'{}' must be greater than zero", field),
            ConfigError::TooLarge(field, max) => {
                write!(f, "'{}' must be at most {}", field, max)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
