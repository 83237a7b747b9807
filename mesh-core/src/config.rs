//! Layered configuration: CLI arguments override environment variables
//! override a TOML file override compiled defaults. A missing config
//! file is not an error; an explicit `--config` path that does not
//! exist is.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("workspace key must be 64 hex characters: {0}")]
    InvalidWorkspaceKey(String),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    overlay: OverlayFileConfig,
    transport: TransportFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OverlayFileConfig {
    max_connections: Option<usize>,
    bootstrap_timeout_ms: Option<u64>,
    discovery_interval_ms: Option<u64>,
    awareness_throttle_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    relay_url: Option<String>,
    direct_bind_addr: Option<String>,
    dht_sidecar_addr: Option<String>,
    local_listen_port: Option<u16>,
}

/// Fully resolved mesh configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Upper bound on simultaneously connected peers per workspace.
    pub max_connections: usize,
    /// How long `join_workspace` waits for the seed round to settle
    /// before returning with whatever peers it has.
    pub bootstrap_timeout: Duration,
    /// Interval between maintenance sweeps (eviction, re-discovery,
    /// re-announce).
    pub discovery_interval: Duration,
    /// Awareness update coalescing window.
    pub awareness_throttle: Duration,
    /// Rendezvous server WebSocket URL.
    pub relay_url: String,
    /// Local bind address for the QUIC direct-transport endpoint.
    pub direct_bind_addr: String,
    /// Address of the local DHT sidecar process.
    pub dht_sidecar_addr: String,
    /// UDP port advertised for local-network discovery.
    pub local_listen_port: u16,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            bootstrap_timeout: Duration::from_millis(10_000),
            discovery_interval: Duration::from_millis(30_000),
            awareness_throttle: Duration::from_millis(100),
            relay_url: "wss://relay.nightjar.dev/ws".to_string(),
            direct_bind_addr: "0.0.0.0:0".to_string(),
            dht_sidecar_addr: "127.0.0.1:4721".to_string(),
            local_listen_port: 0,
        }
    }
}

impl MeshConfig {
    /// Load configuration by merging CLI args and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit `--config` file cannot be
    /// read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            max_connections: file.overlay.max_connections.unwrap_or(defaults.max_connections),
            bootstrap_timeout: file
                .overlay
                .bootstrap_timeout_ms
                .map_or(defaults.bootstrap_timeout, Duration::from_millis),
            discovery_interval: file
                .overlay
                .discovery_interval_ms
                .map_or(defaults.discovery_interval, Duration::from_millis),
            awareness_throttle: file
                .overlay
                .awareness_throttle_ms
                .map_or(defaults.awareness_throttle, Duration::from_millis),
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.transport.relay_url.clone())
                .unwrap_or(defaults.relay_url),
            direct_bind_addr: file.transport.direct_bind_addr.clone().unwrap_or(defaults.direct_bind_addr),
            dht_sidecar_addr: file.transport.dht_sidecar_addr.clone().unwrap_or(defaults.dht_sidecar_addr),
            local_listen_port: file.transport.local_listen_port.unwrap_or(defaults.local_listen_port),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Encrypted peer mesh daemon")]
pub struct CliArgs {
    /// Workspace identifier to join.
    #[arg(long, env = "MESH_WORKSPACE_ID")]
    pub workspace_id: Option<String>,

    /// Hex-encoded 32-byte workspace key.
    #[arg(long, env = "MESH_WORKSPACE_KEY")]
    pub workspace_key: Option<String>,

    /// WebSocket URL of the rendezvous server.
    #[arg(long, env = "MESH_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Path to config file (default: `~/.config/mesh-core/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MESH_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr only).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Parse a hex-encoded 32-byte workspace key.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidWorkspaceKey`] if `hex` is not exactly
/// 64 hex characters.
pub fn parse_workspace_key(hex: &str) -> Result<[u8; 32], ConfigError> {
    if hex.len() != 64 {
        return Err(ConfigError::InvalidWorkspaceKey(hex.to_string()));
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in bytes.iter_mut().enumerate() {
        let byte_str = hex.get(i * 2..i * 2 + 2).ok_or_else(|| ConfigError::InvalidWorkspaceKey(hex.to_string()))?;
        *chunk = u8::from_str_radix(byte_str, 16).map_err(|_| ConfigError::InvalidWorkspaceKey(hex.to_string()))?;
    }
    Ok(bytes)
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile { path: p.to_path_buf(), source: e })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("mesh-core").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
