//! Configuration management for the ZMTP engine.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/zmtp/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zmtp_wire::curve::KEY_SIZE;
use zmtp_wire::greeting::{LONG_PROBE_SIZE, MAX_LEGACY_IDENTITY};
use zmtp_wire::{KeyPair, PublicKey};

use crate::options::{CurveOptions, EngineOptions, SocketType, DEFAULT_BATCH_SIZE};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("identity must be at most 255 bytes, got {0}")]
    InvalidIdentityLength(usize),

    #[error("{name} is out of range, got {value}")]
    InvalidBatchSize { name: &'static str, value: usize },

    #[error("unknown socket_type: {0}")]
    InvalidSocketType(String),

    #[error("{field} is not a valid key: {reason}")]
    InvalidKey { field: &'static str, reason: String },

    #[error("{0} is required for the configured curve role")]
    MissingKey(&'static str),

    #[error("public_key does not match secret_key")]
    KeyMismatch,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Per-connection engine settings.
    pub engine: EngineConfig,

    /// CURVE security settings.
    pub curve: CurveConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Per-connection engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Socket type announced in the greeting.
    pub socket_type: SocketType,

    /// Routing identity sent as the first message (at most 255 bytes).
    pub identity: String,

    /// Maximum bytes read per input event.
    pub in_batch_size: usize,

    /// Maximum bytes encoded per output event.
    pub out_batch_size: usize,

    /// Largest inbound message accepted (0 = unlimited).
    pub max_msg_size: u64,

    /// SO_SNDBUF size (0 = OS default).
    pub send_buffer_size: usize,

    /// SO_RCVBUF size (0 = OS default).
    pub recv_buffer_size: usize,
}

/// CURVE role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CurveRole {
    /// No security; plain connections.
    #[default]
    None,
    /// Authenticate to a server with a known public key.
    Client,
    /// Accept CURVE clients.
    Server,
}

/// CURVE security settings. Keys are 64 hex characters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CurveConfig {
    /// Which side of the handshake we play.
    pub role: CurveRole,

    /// Our long-term public key. Optional; checked against the secret key.
    pub public_key: String,

    /// Our long-term secret key.
    pub secret_key: String,

    /// Server long-term public key (client role only).
    pub server_key: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_type: SocketType::default(),
            identity: String::new(),
            in_batch_size: DEFAULT_BATCH_SIZE,
            out_batch_size: DEFAULT_BATCH_SIZE,
            max_msg_size: 0,
            send_buffer_size: 0,
            recv_buffer_size: 0,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zmtp")
        .join("config.toml")
}

/// Decode a hex-encoded 32-byte key.
fn parse_key(field: &'static str, value: &str) -> Result<[u8; KEY_SIZE], ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| ConfigError::InvalidKey {
        field,
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| ConfigError::InvalidKey {
        field,
        reason: format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()),
    })
}

fn require_key(field: &'static str, value: &str) -> Result<[u8; KEY_SIZE], ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingKey(field));
    }
    parse_key(field, value)
}

impl CurveConfig {
    /// Long-term key pair built from `secret_key`, checked against
    /// `public_key` when that is set.
    fn key_pair(&self) -> Result<KeyPair, ConfigError> {
        let keys = KeyPair::from_secret_bytes(require_key("secret_key", &self.secret_key)?);
        if !self.public_key.trim().is_empty() {
            let public = parse_key("public_key", &self.public_key)?;
            if keys.public.as_bytes() != &public {
                return Err(ConfigError::KeyMismatch);
            }
        }
        Ok(keys)
    }

    /// Engine-level CURVE options for the configured role.
    pub fn curve_options(&self) -> Result<Option<CurveOptions>, ConfigError> {
        Ok(match self.role {
            CurveRole::None => None,
            CurveRole::Client => Some(CurveOptions::Client {
                keys: self.key_pair()?,
                server_key: PublicKey::from(require_key("server_key", &self.server_key)?),
            }),
            CurveRole::Server => Some(CurveOptions::Server {
                keys: self.key_pair()?,
            }),
        })
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ZMTP_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ZMTP_SOCKET_TYPE: Override the socket type
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = std::env::var("ZMTP_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }

        if let Ok(socket_type) = std::env::var("ZMTP_SOCKET_TYPE") {
            if !socket_type.is_empty() {
                tracing::info!("Overriding socket_type from environment: {}", socket_type);
                self.engine.socket_type = socket_type.parse()?;
            }
        }

        Ok(())
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        if self.engine.identity.len() > MAX_LEGACY_IDENTITY {
            return Err(ConfigError::InvalidIdentityLength(self.engine.identity.len()));
        }

        if self.engine.in_batch_size < LONG_PROBE_SIZE {
            return Err(ConfigError::InvalidBatchSize {
                name: "in_batch_size",
                value: self.engine.in_batch_size,
            });
        }
        if self.engine.out_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                name: "out_batch_size",
                value: self.engine.out_batch_size,
            });
        }

        self.curve.curve_options()?;
        Ok(())
    }

    /// Build per-connection engine options from this configuration.
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        let non_zero = |size: usize| (size > 0).then_some(size);
        let options = EngineOptions {
            socket_type: self.engine.socket_type,
            identity: self.engine.identity.as_bytes().to_vec(),
            in_batch_size: self.engine.in_batch_size,
            out_batch_size: self.engine.out_batch_size,
            max_msg_size: (self.engine.max_msg_size > 0).then_some(self.engine.max_msg_size),
            send_buffer_size: non_zero(self.engine.send_buffer_size),
            recv_buffer_size: non_zero(self.engine.recv_buffer_size),
            curve: self.curve.curve_options()?,
        };
        options.validate()?;
        Ok(options)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
