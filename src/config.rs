//! Configuration for the hashload server and client.
//!
//! Both binaries take their required parameters positionally and accept
//! an optional TOML configuration file for the rest.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "hashload-server")]
#[command(version = "0.1.0")]
#[command(about = "Hashes fixed-size payloads on a worker pool", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on
    pub port: u16,

    /// Number of worker threads in the pool
    pub pool_size: usize,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds between statistics reports (0 disables them)
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "hashload-client")]
#[command(version = "0.1.0")]
#[command(about = "Sends random payloads and verifies ordered hash acknowledgements", long_about = None)]
pub struct ClientArgs {
    /// Server host name or address
    pub server_host: String,

    /// Server port
    pub server_port: u16,

    /// Messages per second per connection
    pub rate: u32,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of concurrent connections
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Stop each connection after this many messages
    #[arg(short, long)]
    pub messages: Option<u64>,

    /// Seconds between statistics reports (0 disables them)
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds between statistics reports
    #[serde(default = "default_server_stats_interval")]
    pub stats_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_connections: default_max_connections(),
            stats_interval: default_server_stats_interval(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Number of concurrent connections
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Messages per connection before stopping (unset = run forever)
    pub messages: Option<u64>,
    /// Seconds between statistics reports
    #[serde(default = "default_client_stats_interval")]
    pub stats_interval: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            messages: None,
            stats_interval: default_client_stats_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_server_stats_interval() -> u64 {
    60
}

fn default_connections() -> usize {
    1
}

fn default_client_stats_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_toml(path: Option<&Path>) -> Result<TomlConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {host}:{port}"),
        )
    })
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub pool_size: usize,
    pub max_connections: usize,
    pub stats_interval: u64,
    pub log_level: String,
}

impl ServerConfig {
    /// Defaults for everything but the required parameters.
    pub fn new(port: u16, pool_size: usize) -> Self {
        let defaults = TomlConfig::default();
        Self {
            host: defaults.server.host,
            port,
            pool_size,
            max_connections: defaults.server.max_connections,
            stats_interval: defaults.server.stats_interval,
            log_level: defaults.logging.level,
        }
    }

    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(args.config.as_deref())?;

        let config = ServerConfig {
            host: args.host.unwrap_or(toml_config.server.host),
            port: args.port,
            pool_size: args.pool_size,
            max_connections: args
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            stats_interval: args
                .stats_interval
                .unwrap_or(toml_config.server.stats_interval),
            log_level: args.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("thread pool size must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max connections must be at least 1"));
        }
        Ok(())
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        resolve(&self.host, self.port)
    }

    /// Interval between statistics reports, `None` if disabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub rate: u32,
    pub connections: usize,
    pub messages: Option<u64>,
    pub stats_interval: u64,
    pub log_level: String,
}

impl ClientConfig {
    /// Defaults for everything but the required parameters.
    pub fn new(server_host: impl Into<String>, server_port: u16, rate: u32) -> Self {
        let defaults = TomlConfig::default();
        Self {
            server_host: server_host.into(),
            server_port,
            rate,
            connections: defaults.client.connections,
            messages: defaults.client.messages,
            stats_interval: defaults.client.stats_interval,
            log_level: defaults.logging.level,
        }
    }

    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    pub fn from_args(args: ClientArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(args.config.as_deref())?;

        let config = ClientConfig {
            server_host: args.server_host,
            server_port: args.server_port,
            rate: args.rate,
            connections: args.connections.unwrap_or(toml_config.client.connections),
            messages: args.messages.or(toml_config.client.messages),
            stats_interval: args
                .stats_interval
                .unwrap_or(toml_config.client.stats_interval),
            log_level: args.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::Invalid("message rate must be at least 1"));
        }
        if self.rate > 1000 {
            return Err(ConfigError::Invalid("message rate must be at most 1000"));
        }
        if self.connections == 0 {
            return Err(ConfigError::Invalid("connections must be at least 1"));
        }
        Ok(())
    }

    /// Address of the server.
    pub fn server_addr(&self) -> io::Result<SocketAddr> {
        resolve(&self.server_host, self.server_port)
    }

    /// Pause between messages on one connection: `1000 / rate` ms.
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.rate.max(1)))
    }

    /// Interval between statistics reports, `None` if disabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
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
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.stats_interval, 60);
        assert_eq!(config.client.connections, 1);
        assert_eq!(config.client.messages, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            max_connections = 500

            [client]
            connections = 100
            messages = 20
            stats_interval = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_connections, 500);
        assert_eq!(config.server.stats_interval, 60);
        assert_eq!(config.client.connections, 100);
        assert_eq!(config.client.messages, Some(20));
        assert_eq!(config.client.stats_interval, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_server_positional_args() {
        let args = ServerArgs::try_parse_from(["hashload-server", "5000", "8"]).unwrap();
        let config = ServerConfig::from_args(args).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let path = std::env::temp_dir().join(format!("hashload-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[client]\nconnections = 4\nmessages = 9\n[logging]\nlevel = \"warn\"\n").unwrap();

        let args = ClientArgs::try_parse_from([
            "hashload-client",
            "localhost",
            "5000",
            "4",
            "--config",
            path.to_str().unwrap(),
            "--connections",
            "2",
        ])
        .unwrap();
        let config = ClientConfig::from_args(args).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.connections, 2);
        assert_eq!(config.messages, Some(9));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.send_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = ServerArgs::try_parse_from(["hashload-server", "5000", "0"]).unwrap();
        assert!(matches!(ServerConfig::from_args(args), Err(ConfigError::Invalid(_))));

        let args = ClientArgs::try_parse_from(["hashload-client", "localhost", "5000", "0"]).unwrap();
        assert!(matches!(ClientConfig::from_args(args), Err(ConfigError::Invalid(_))));

        // Missing positional parameters
        assert!(ClientArgs::try_parse_from(["hashload-client", "localhost"]).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = ServerArgs::try_parse_from([
            "hashload-server",
            "5000",
            "2",
            "--config",
            "/nonexistent/hashload.toml",
        ])
        .unwrap();
        assert!(matches!(ServerConfig::from_args(args), Err(ConfigError::FileRead(..))));
    }

    #[test]
    fn test_address_resolution() {
        let config = ClientConfig::new("127.0.0.1", 7000, 2);
        assert_eq!(config.server_addr().unwrap(), "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(10)));

        let mut config = ServerConfig::new(0, 1);
        config.stats_interval = 0;
        assert!(config.stats_interval().is_none());
    }
}
