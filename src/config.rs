//! Configuration for the echoplex server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::DEFAULT_FRAME_SIZE;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// I/O notification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One blocking service thread per connection.
    Blocking,
    /// Level-triggered readiness multiplexing via poll(2).
    Poll,
    /// Edge-triggered readiness multiplexing (epoll/kqueue via mio).
    Epoll,
    /// Completion-based asynchronous I/O (io_uring, Linux only).
    Uring,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echoplex")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server with selectable I/O models", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// I/O backend to run
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<Backend>,

    /// Maximum number of concurrent connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Frame buffer capacity in bytes (per-read echo limit)
    #[arg(short = 'f', long)]
    pub frame_size: Option<usize>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// I/O backend to run
    pub backend: Option<Backend>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Frame buffer capacity in bytes
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: None,
            max_connections: default_max_connections(),
            frame_size: default_frame_size(),
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
    "127.0.0.1:9001".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backend: Backend,
    pub max_connections: usize,
    pub frame_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backend: cli
                .backend
                .or(toml_config.server.backend)
                .unwrap_or(default_backend()),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            frame_size: cli.frame_size.unwrap_or(toml_config.server.frame_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Platform-appropriate default backend.
fn default_backend() -> Backend {
    #[cfg(target_os = "linux")]
    {
        Backend::Epoll
    }
    #[cfg(not(target_os = "linux"))]
    {
        Backend::Blocking
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
