//! Layered configuration for the rendezvous server.
//!
//! Priority (highest first): CLI arguments, environment variables (via
//! clap `env` attributes), a TOML config file, compiled defaults.

use std::path::PathBuf;

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
}

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    rate_per_sec: Option<u32>,
    burst: Option<u32>,
}

/// CLI arguments for the rendezvous server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Mesh rendezvous/relay server")]
pub struct RelayCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "MESH_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/mesh-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Sustained requests/second allowed per connection.
    #[arg(long)]
    pub rate_per_sec: Option<u32>,

    /// Burst capacity above the sustained rate.
    #[arg(long)]
    pub burst: Option<u32>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MESH_RELAY_LOG")]
    pub log_level: String,
}

/// Fully resolved rendezvous server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Sustained requests/second allowed per connection.
    pub rate_per_sec: u32,
    /// Burst capacity above the sustained rate.
    pub burst: u32,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            rate_per_sec: crate::ratelimit::DEFAULT_RATE_PER_SEC,
            burst: crate::ratelimit::DEFAULT_BURST,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit `--config` file cannot be
    /// read or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli.bind.clone().or_else(|| file.server.bind_addr.clone()).unwrap_or(defaults.bind_addr),
            rate_per_sec: cli.rate_per_sec.or(file.server.rate_per_sec).unwrap_or(defaults.rate_per_sec),
            burst: cli.burst.or(file.server.burst).unwrap_or(defaults.burst),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile { path: p.to_path_buf(), source: e })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("mesh-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
