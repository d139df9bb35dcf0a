//! Configuration module for peerchat.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::chat::validate_name;
use crate::{PeerchatError, Result};

/// Relay server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port used by `/startserver` when no port is given.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent peer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long `stop()` waits for session loops before force-closing them.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Start listening as soon as the process starts.
    ///
    /// A bind failure is then fatal (exit code 1).
    #[serde(default)]
    pub autostart: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    64
}

fn default_shutdown_timeout() -> u64 {
    3000
}

impl ServerConfig {
    /// Shutdown deadline as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            autostart: false,
        }
    }
}

/// Per-connection settings shared by inbound and outbound sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the outbound queue before the oldest frame is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum payload size in bytes for a single frame.
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    /// Timeout for `/connect`.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// How long a closing session may spend flushing queued frames.
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
    /// How long a new peer has to pick a name before it is dropped.
    #[serde(default = "default_name_timeout")]
    pub name_timeout_secs: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_payload() -> usize {
    4096
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_name_timeout() -> u64 {
    60
}

fn default_flush_timeout() -> u64 {
    500
}

impl SessionConfig {
    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Name exchange deadline as a `Duration`.
    pub fn name_timeout(&self) -> Duration {
        Duration::from_secs(self.name_timeout_secs)
    }

    /// Flush deadline as a `Duration`.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_payload_bytes: default_max_payload(),
            connect_timeout_secs: default_connect_timeout(),
            flush_timeout_ms: default_flush_timeout(),
            name_timeout_secs: default_name_timeout(),
        }
    }
}

/// Built-in bot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Whether the built-in command bot is registered.
    #[serde(default = "default_bot_enabled")]
    pub enabled: bool,
    /// Sender name used for bot replies.
    #[serde(default = "default_bot_name")]
    pub name: String,
    /// Prefix that marks a chat line as a bot command.
    #[serde(default = "default_bot_prefix")]
    pub prefix: String,
    /// Per-handler timeout in milliseconds.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_ms: u64,
}

fn default_bot_enabled() -> bool {
    true
}

fn default_bot_name() -> String {
    "ChatBot".to_string()
}

fn default_bot_prefix() -> String {
    "!".to_string()
}

fn default_handler_timeout() -> u64 {
    2000
}

impl BotConfig {
    /// Handler timeout as a `Duration`.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: default_bot_enabled(),
            name: default_bot_name(),
            prefix: default_bot_prefix(),
            handler_timeout_ms: default_handler_timeout(),
        }
    }
}

/// Local chat identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Sender name for lines typed by the local user.
    #[serde(default = "default_display_name")]
    pub name: String,
}

fn default_display_name() -> String {
    "host".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            name: default_display_name(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/peerchat.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Session configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// Bot configuration.
    #[serde(default)]
    pub bot: BotConfig,
    /// Local identity.
    #[serde(default)]
    pub chat: ChatConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(PeerchatError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| PeerchatError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `PEERCHAT_PORT`: default port for `/startserver`
    /// - `PEERCHAT_NAME`: local display name
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PEERCHAT_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PEERCHAT_PORT={port:?}"),
            }
        }
        if let Ok(name) = std::env::var("PEERCHAT_NAME") {
            if !name.trim().is_empty() {
                self.chat.name = name.trim().to_string();
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the outbound queue or payload limit is zero
    /// - the local display name or bot name is empty or contains whitespace
    /// - the bot is enabled with an empty prefix
    pub fn validate(&self) -> Result<()> {
        if self.session.queue_capacity == 0 {
            return Err(PeerchatError::Config(
                "session.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.max_payload_bytes == 0 {
            return Err(PeerchatError::Config(
                "session.max_payload_bytes must be at least 1".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(PeerchatError::Config(
                "server.max_connections must be at least 1".to_string(),
            ));
        }
        for (key, name) in [("chat.name", &self.chat.name), ("bot.name", &self.bot.name)] {
            validate_name(name).map_err(|e| match e {
                PeerchatError::Validation(reason) => {
                    PeerchatError::Config(format!("{key}: {reason}"))
                }
                other => other,
            })?;
        }
        if self.chat.name == self.bot.name {
            return Err(PeerchatError::Config(
                "chat.name and bot.name must differ".to_string(),
            ));
        }
        if self.bot.enabled && self.bot.prefix.is_empty() {
            return Err(PeerchatError::Config(
                "bot.prefix must not be empty when the bot is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
