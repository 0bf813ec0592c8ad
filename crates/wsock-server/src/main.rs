//! wsock-server: WebSocket echo server, entry point.
//!
//! Accepts WebSocket connections on a TCP port and answers every text message
//! with `"Got your message:" + message`.
//!
//! # Usage
//!
//! ```text
//! wsock-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>            TOML config file
//!   --port <PORT>              Listening port [default: 80]
//!   --bind <IP>                Interface address [default: first local IPv4]
//!   --max-message-size <BYTES> Largest outbound message [default: 65535]
//!   --log-level <FILTER>       tracing filter, e.g. `debug` or `wsock_server=trace`
//!   --print-default-config     Print the default TOML config and exit
//! ```
//!
//! # Precedence
//!
//! CLI flag > environment variable > config file > built-in default.
//!
//! | Variable                 | Flag                 |
//! |--------------------------|----------------------|
//! | `WSOCK_CONFIG`           | `--config`           |
//! | `WSOCK_PORT`             | `--port`             |
//! | `WSOCK_BIND`             | `--bind`             |
//! | `WSOCK_MAX_MESSAGE_SIZE` | `--max-message-size` |
//! | `WSOCK_LOG_LEVEL`        | `--log-level`        |
//!
//! `RUST_LOG` is honoured when `--log-level` is not given, and takes
//! precedence over the config file's `log_level`.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wsock_server::application::attach_echo;
use wsock_server::domain::ServerConfig;
use wsock_server::infrastructure::config_file::{default_config_toml, load_config, ConfigFile};
use wsock_server::infrastructure::Server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket echo server over raw TCP.
#[derive(Debug, Parser)]
#[command(
    name = "wsock-server",
    about = "WebSocket server that echoes every text message back to its sender",
    version
)]
struct Cli {
    /// Path to a TOML config file with a `[server]` table.
    #[arg(long, env = "WSOCK_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port to listen on.  `0` lets the OS choose.
    #[arg(long, env = "WSOCK_PORT")]
    port: Option<u16>,

    /// IP address to bind to.
    ///
    /// When omitted (here and in the config file) the server binds to the
    /// first local IPv4 interface address.
    #[arg(long, env = "WSOCK_BIND")]
    bind: Option<String>,

    /// Largest outbound text message, in UTF-8 bytes.
    #[arg(long, env = "WSOCK_MAX_MESSAGE_SIZE")]
    max_message_size: Option<usize>,

    /// `tracing` filter directive (overrides `RUST_LOG`).
    #[arg(long, env = "WSOCK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

impl Cli {
    /// Reads the config file named by `--config`, or returns the defaults.
    fn load_file(&self) -> anyhow::Result<ConfigFile> {
        match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config file {}", path.display())),
            None => Ok(ConfigFile::default()),
        }
    }

    /// Applies CLI overrides on top of the file configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` is not a valid IP address.
    fn into_server_config(self, file: &ConfigFile) -> anyhow::Result<ServerConfig> {
        let mut config = file.server.to_server_config();

        if let Some(bind) = &self.bind {
            let ip: IpAddr = bind
                .parse()
                .with_context(|| format!("invalid bind address: '{bind}'"))?;
            config.bind_address = Some(ip);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_message_size {
            config.limits.max_message_size = max;
        }

        Ok(config)
    }

    /// Builds the log filter: `--log-level`, then `RUST_LOG`, then the file.
    fn env_filter(&self, file: &ConfigFile) -> EnvFilter {
        if let Some(level) = &self.log_level {
            return EnvFilter::new(level);
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&file.server.log_level))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed and the optional config file is loaded.
/// 2. `tracing_subscriber` is initialised with the resolved log filter.
/// 3. The server binds its listener and the echo consumer is attached.
/// 4. The process waits for Ctrl+C, then shuts the server down.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        print!("{}", default_config_toml()?);
        return Ok(());
    }

    let file = cli.load_file()?;

    tracing_subscriber::fmt()
        .with_env_filter(cli.env_filter(&file))
        .init();

    let config = cli.into_server_config(&file)?;

    let server = Server::bind(config)
        .await
        .context("failed to start WebSocket server")?;
    attach_echo(&server);

    if let Some(addr) = server.local_addr() {
        info!("wsock-server ready on ws://{addr}/");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl+C signal: {e}");
    } else {
        info!("received Ctrl+C; shutting down");
    }
    server.shutdown();

    info!("wsock-server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wsock_server::infrastructure::config_file::parse_config;

    #[test]
    fn test_cli_defaults_leave_every_override_unset() {
        // Arrange / Act
        let cli = Cli::parse_from(["wsock-server"]);

        // Assert
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
        assert!(cli.bind.is_none());
        assert!(!cli.print_default_config);
    }

    #[test]
    fn test_into_server_config_without_overrides_uses_defaults() {
        let cli = Cli::parse_from(["wsock-server"]);

        let config = cli.into_server_config(&ConfigFile::default()).unwrap();

        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_cli_port_overrides_file_port() {
        // Arrange
        let file = parse_config("[server]\nport = 9000\n").unwrap();
        let cli = Cli::parse_from(["wsock-server", "--port", "8989"]);

        // Act
        let config = cli.into_server_config(&file).unwrap();

        // Assert
        assert_eq!(config.port, 8989);
    }

    #[test]
    fn test_file_port_used_when_cli_port_absent() {
        let file = parse_config("[server]\nport = 9000\n").unwrap();
        let cli = Cli::parse_from(["wsock-server"]);

        let config = cli.into_server_config(&file).unwrap();

        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_cli_bind_sets_explicit_address() {
        let cli = Cli::parse_from(["wsock-server", "--bind", "127.0.0.1", "--port", "0"]);

        let config = cli.into_server_config(&ConfigFile::default()).unwrap();

        assert_eq!(
            config.explicit_socket_addr(),
            Some("127.0.0.1:0".parse().unwrap())
        );
    }

    #[test]
    fn test_cli_max_message_size_override() {
        let cli = Cli::parse_from(["wsock-server", "--max-message-size", "1024"]);

        let config = cli.into_server_config(&ConfigFile::default()).unwrap();

        assert_eq!(config.limits.max_message_size, 1024);
    }

    #[test]
    fn test_invalid_bind_address_returns_error() {
        // Arrange
        let cli = Cli::parse_from(["wsock-server", "--bind", "not.an.ip"]);

        // Act
        let result = cli.into_server_config(&ConfigFile::default());

        // Assert: must return an error, not panic
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file_returns_error() {
        let cli = Cli::parse_from(["wsock-server", "--config", "/no/such/wsock.toml"]);
        assert!(cli.load_file().is_err());
    }
}
