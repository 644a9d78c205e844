//! Configuration system for the Parley relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/parley-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use parley_proto::codec::DEFAULT_MAX_FRAME_SIZE;

use crate::registry::DuplicatePolicy;
use crate::session::SessionLimits;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A resolved value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    host: Option<String>,
    port: Option<u16>,
    max_frame_size: Option<usize>,
    outbound_queue_size: Option<usize>,
    handshake_timeout_secs: Option<u64>,
    max_connections: Option<usize>,
    duplicate_policy: Option<DuplicatePolicy>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Parley relay server")]
pub struct RelayCliArgs {
    /// Host address to listen on.
    #[arg(long, env = "PARLEY_HOST")]
    pub host: Option<String>,

    /// TCP port to listen on.
    #[arg(short, long, env = "PARLEY_PORT")]
    pub port: Option<u16>,

    /// Path to config file (default: `~/.config/parley-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum size of a single frame in bytes (file payloads included).
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum number of frames buffered for one slow client.
    #[arg(long)]
    pub outbound_queue_size: Option<usize>,

    /// Seconds a new connection has to send its identity.
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Maximum number of concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// What to do when a name that is already connected connects again.
    #[arg(long, value_enum)]
    pub duplicate_policy: Option<DuplicatePolicy>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PARLEY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host address to listen on (e.g., `0.0.0.0`).
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Maximum allowed frame size in bytes.
    pub max_frame_size: usize,
    /// Maximum number of frames queued per client before deliveries fail.
    pub outbound_queue_size: usize,
    /// Time allowed for a new connection to identify itself.
    pub handshake_timeout: Duration,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Policy for a connection that claims an already-connected name.
    pub duplicate_policy: DuplicatePolicy,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7500,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue_size: 256,
            handshake_timeout: Duration::from_secs(10),
            max_connections: 1024,
            duplicate_policy: DuplicatePolicy::Reject,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a resolved limit is zero.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            host: cli
                .host
                .clone()
                .or_else(|| file.server.host.clone())
                .unwrap_or(defaults.host),
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            outbound_queue_size: cli
                .outbound_queue_size
                .or(file.server.outbound_queue_size)
                .unwrap_or(defaults.outbound_queue_size),
            handshake_timeout: cli
                .handshake_timeout_secs
                .or(file.server.handshake_timeout_secs)
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            max_connections: cli
                .max_connections
                .or(file.server.max_connections)
                .unwrap_or(defaults.max_connections),
            duplicate_policy: cli
                .duplicate_policy
                .or(file.server.duplicate_policy)
                .unwrap_or(defaults.duplicate_policy),
            log_level: cli.log_level.clone(),
        }
    }

    /// Rejects limits that would make the relay unusable.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_size must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the `host:port` address string to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the per-connection limits derived from this configuration.
    #[must_use]
    pub const fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_frame_size: self.max_frame_size,
            outbound_queue_size: self.outbound_queue_size,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("parley-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
