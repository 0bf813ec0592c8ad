//! TOML configuration file for the `wsock-server` binary.
//!
//! Every field is optional; missing fields fall back to the defaults in
//! [`crate::domain::config`].  Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8989
//! max_message_size = 65535
//! log_level = "debug"
//! ```
//!
//! Omitting `bind_address` makes the server listen on the first local IPv4
//! interface address.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::config::{
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_HANDSHAKE_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_OUTBOUND_QUEUE_SIZE, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE,
};
use crate::domain::{ConnectionLimits, ServerConfig};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level layout of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// The `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Interface to bind.  Absent means the first local IPv4 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u64,
    #[serde(default = "default_max_handshake_size")]
    pub max_handshake_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// `tracing` level used when neither `--log-level` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_max_frame_size() -> u64 {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_max_handshake_size() -> usize {
    DEFAULT_MAX_HANDSHAKE_SIZE
}
fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}
fn default_outbound_queue_size() -> usize {
    DEFAULT_OUTBOUND_QUEUE_SIZE
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: default_port(),
            max_message_size: default_max_message_size(),
            max_frame_size: default_max_frame_size(),
            max_handshake_size: default_max_handshake_size(),
            read_buffer_size: default_read_buffer_size(),
            outbound_queue_size: default_outbound_queue_size(),
            log_level: default_log_level(),
        }
    }
}

impl ServerSection {
    /// Converts the file representation into the runtime [`ServerConfig`].
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address,
            port: self.port,
            limits: ConnectionLimits {
                max_message_size: self.max_message_size,
                max_frame_size: self.max_frame_size,
                max_handshake_size: self.max_handshake_size,
                read_buffer_size: self.read_buffer_size,
                outbound_queue_size: self.outbound_queue_size,
            },
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Reads and parses the config file at `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parses config TOML from a string.
pub fn parse_config(content: &str) -> Result<ConfigFile, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Renders the default configuration as TOML, for `--print-default-config`.
pub fn default_config_toml() -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(&ConfigFile::default())?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        // Arrange / Act
        let cfg = parse_config("").expect("parse");

        // Assert
        assert_eq!(cfg, ConfigFile::default());
        assert_eq!(cfg.server.to_server_config(), ServerConfig::default());
    }

    #[test]
    fn test_partial_server_table_keeps_other_defaults() {
        // Arrange
        let toml_str = "[server]\nport = 8989\nbind_address = \"127.0.0.1\"\n";

        // Act
        let cfg = parse_config(toml_str).expect("parse").server.to_server_config();

        // Assert
        assert_eq!(cfg.port, 8989);
        assert_eq!(cfg.bind_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(cfg.limits, ConnectionLimits::default());
    }

    #[test]
    fn test_limits_are_read_from_file() {
        let toml_str = "[server]\nmax_message_size = 1024\nmax_frame_size = 2048\n\
                        outbound_queue_size = 16\n";

        let limits = parse_config(toml_str).unwrap().server.to_server_config().limits;

        assert_eq!(limits.max_message_size, 1024);
        assert_eq!(limits.max_frame_size, 2048);
        assert_eq!(limits.outbound_queue_size, 16);
    }

    #[test]
    fn test_invalid_bind_address_is_parse_error() {
        let result = parse_config("[server]\nbind_address = \"not-an-ip\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_io_error_with_path() {
        let path = Path::new("/definitely/not/here/wsock.toml");

        let result = load_config(path);

        assert!(matches!(result, Err(ConfigError::Io { path: p, .. }) if p == path));
    }

    #[test]
    fn test_default_config_toml_parses_back_to_defaults() {
        // Arrange
        let rendered = default_config_toml().expect("serialize");

        // Act
        let restored = parse_config(&rendered).expect("parse");

        // Assert
        assert!(rendered.contains("[server]"));
        assert_eq!(restored, ConfigFile::default());
    }
}
