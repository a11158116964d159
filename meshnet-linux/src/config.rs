//! Load config from file and environment.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use meshnet_core::PrefixSet;
use serde::Deserialize;

/// Daemon configuration. File: `--config`, else ~/.config/meshnet/config.toml
/// or /etc/meshnet/config.toml.
/// Env overrides: MESHNET_NODE_ID, MESHNET_DIRECTORY, MESHNET_MESH_CIDR,
/// MESHNET_DATA_DIR, MESHNET_EXTERNAL_ADDRESS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's ID in the directory.
    #[serde(default)]
    pub node_id: String,
    /// Directory address (host:port).
    #[serde(default = "default_directory")]
    pub directory: SocketAddr,
    /// Range routed through the mesh interface (default 10.192.0.0/11).
    #[serde(default = "default_mesh_cidr")]
    pub mesh_cidr: IpNet,
    /// Where the WireGuard key is kept (default /var/lib/meshnet).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Address other nodes reach this node's tunnel on.
    #[serde(default)]
    pub external_address: Option<IpAddr>,
    /// Prefixes routed to this node, besides its external address.
    #[serde(default)]
    pub prefixes: Vec<IpNet>,
    /// Pause before a failed loop is restarted (default 1000).
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

fn default_directory() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7840))
}
fn default_mesh_cidr() -> IpNet {
    IpNet::from(ipnet::Ipv4Net::new_assert([10, 192, 0, 0].into(), 11))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshnet")
}
fn default_restart_delay_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            directory: default_directory(),
            mesh_cidr: default_mesh_cidr(),
            data_dir: default_data_dir(),
            external_address: None,
            prefixes: Vec::new(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl Config {
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("clusternet.key")
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn prefix_set(&self) -> PrefixSet {
        self.prefixes.iter().copied().collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {var}={value:?}")]
    Env { var: &'static str, value: String },
    #[error("node_id is not set")]
    MissingNodeId,
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit `path` must exist.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_overrides(&mut c, |var| std::env::var(var).ok())?;
    if c.node_id.is_empty() {
        return Err(ConfigError::MissingNodeId);
    }
    Ok(c)
}

/// Apply MESHNET_* overrides, looked up through `lookup`.
pub fn apply_overrides(
    c: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(s) = lookup("MESHNET_NODE_ID") {
        c.node_id = s;
    }
    if let Some(s) = lookup("MESHNET_DIRECTORY") {
        c.directory = parse_env("MESHNET_DIRECTORY", s)?;
    }
    if let Some(s) = lookup("MESHNET_MESH_CIDR") {
        c.mesh_cidr = parse_env("MESHNET_MESH_CIDR", s)?;
    }
    if let Some(s) = lookup("MESHNET_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = lookup("MESHNET_EXTERNAL_ADDRESS") {
        c.external_address = if s.is_empty() {
            None
        } else {
            Some(parse_env("MESHNET_EXTERNAL_ADDRESS", s)?)
        };
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshnet/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
