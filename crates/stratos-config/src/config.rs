//! Configuration structs with sensible defaults and RON persistence.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratos_net::session::MIN_BUFFER_SIZE;
use stratos_net::{FrameConfig, OverreadPolicy, ServerConfig, SessionConfig, SocketConfig};

use crate::error::ConfigError;

/// Name of the configuration file inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and session settings.
    pub server: ListenerConfig,
    /// Where decoded packets are written.
    pub sink: SinkConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Listener and per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind.
    pub bind_address: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Maximum concurrent sensor connections; extra connections are closed.
    pub max_connections: usize,
    /// Reusable read buffer per connection, in bytes. Must be at least 9.
    pub buffer_size: usize,
    /// Largest payload a header may announce, in bytes.
    pub max_payload_size: u64,
    /// What to do with surplus bytes read while completing a payload.
    pub overread_policy: OverreadPolicy,
    /// Close a connection after this many seconds without data (0 = never).
    pub read_timeout_secs: u64,
}

/// Filesystem sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    /// Directory receiving `<client>.jpg`, `<client>-temp.txt`, etc.
    pub root_path: PathBuf,
    /// Delete files left in `root_path` by a previous run on startup.
    pub clear_on_start: bool,
    /// Append structured records as JSON lines to this file.
    pub records_path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g., "info", "stratos_net=debug").
    pub log_level: String,
    /// Directory for the JSON log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            max_connections: 64,
            buffer_size: 8192,
            max_payload_size: stratos_net::framing::DEFAULT_MAX_PAYLOAD_SIZE,
            overread_policy: OverreadPolicy::Carry,
            read_timeout_secs: 0,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("logs"),
            clear_on_start: true,
            records_path: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Platform config directory for Stratos, e.g. `~/.config/stratos`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stratos")
}

/// Path of the config file inside `config_dir`.
pub fn config_file(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE)
}

// --- Load / Save / Validate ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_file(config_dir);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_file(config_dir), serialized).map_err(ConfigError::WriteError)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} is smaller than the {MIN_BUFFER_SIZE}-byte frame header",
                server.buffer_size
            )));
        }
        if server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if server.max_payload_size == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_size must be at least 1".to_string(),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// The socket address the listener binds.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "bind_address {:?} is not an IP address",
                self.server.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Validate and convert into the listener's runtime configuration.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        self.validate()?;
        let server = &self.server;
        let read_timeout = (server.read_timeout_secs > 0)
            .then(|| Duration::from_secs(server.read_timeout_secs));

        Ok(ServerConfig {
            bind_addr: self.bind_addr()?,
            max_connections: server.max_connections,
            session: SessionConfig {
                buffer_size: server.buffer_size,
                frame: FrameConfig {
                    max_payload_size: server.max_payload_size,
                },
                overread: server.overread_policy,
                read_timeout,
            },
            socket: SocketConfig::default(),
            ..ServerConfig::default()
        })
    }
}
