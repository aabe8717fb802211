//! Configuration for the ringnet-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use ringnet::protocols::websocket::MessageType;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "ringnet-echo")]
#[command(version = "0.1.0")]
#[command(about = "A websocket echo server on the ringnet runtime", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of poller threads
    #[arg(short = 'p', long)]
    pub pollers: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Message type for byte-stream connections (text or binary)
    #[arg(long)]
    pub message_type: Option<String>,

    /// Write frame header and payload with one call
    #[arg(long)]
    pub combined_writes: bool,

    /// Print transport metrics every N seconds
    #[arg(long)]
    pub show_metrics: Option<u64>,

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
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of poller threads
    pub pollers: Option<usize>,
    /// TCP keep-alive period in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Idle timeout in seconds
    #[serde(default)]
    pub idle_timeout: u64,
    /// Metrics report period in seconds
    pub show_metrics: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            pollers: None,
            keep_alive: default_keep_alive(),
            idle_timeout: 0,
            show_metrics: None,
        }
    }
}

/// Websocket configuration
#[derive(Debug, Deserialize, Default)]
pub struct WebSocketConfig {
    pub message_type: Option<String>,
    #[serde(default)]
    pub combined_writes: bool,
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
    "127.0.0.1:8080".to_string()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub pollers: Option<usize>,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    pub message_type: Option<MessageType>,
    pub combined_writes: bool,
    pub show_metrics: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let message_type = match cli.message_type.or(file.websocket.message_type) {
            Some(name) => Some(
                name.parse::<MessageType>()
                    .map_err(|_| ConfigError::Invalid(format!("message type {name:?}")))?,
            ),
            None => None,
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            pollers: cli.pollers.or(file.server.pollers),
            keep_alive: Duration::from_secs(file.server.keep_alive),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(file.server.idle_timeout),
            ),
            message_type,
            combined_writes: cli.combined_writes || file.websocket.combined_writes,
            show_metrics: cli
                .show_metrics
                .or(file.server.show_metrics)
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(what) => write!(f, "Invalid {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.keep_alive, 15);
        assert_eq!(config.server.idle_timeout, 0);
        assert!(!config.websocket.combined_writes);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            pollers = 4
            idle_timeout = 30

            [websocket]
            message_type = "binary"
            combined_writes = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.pollers, Some(4));
        assert_eq!(config.server.idle_timeout, 30);
        assert_eq!(config.websocket.message_type.as_deref(), Some("binary"));
        assert!(config.websocket.combined_writes);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_takes_precedence() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            idle_timeout = 30
            [websocket]
            message_type = "text"
            "#,
        )
        .unwrap();
        let cli = CliArgs::parse_from([
            "ringnet-echo",
            "--listen",
            "127.0.0.1:7000",
            "--message-type",
            "binary",
            "--show-metrics",
            "5",
        ]);
        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.message_type, Some(MessageType::Binary));
        assert_eq!(config.show_metrics, Some(Duration::from_secs(5)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_message_type() {
        let cli = CliArgs::parse_from(["ringnet-echo", "--message-type", "ping"]);
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
