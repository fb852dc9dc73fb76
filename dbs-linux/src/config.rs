//! Load config from file, environment and command line.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use dbs_core::{CoreConfig, PeerId, Version};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/dbs/config.toml or /etc/dbs/config.toml.
/// Env overrides: DBS_PEER_ID, DBS_STORAGE_DIR, DBS_MAX_STORAGE_BYTES.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_peer_id")]
    pub peer_id: u32,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Parent of the per-peer `backup-<id>` directory.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_storage_bytes: u64,
    #[serde(default = "default_control")]
    pub control: ChannelConfig,
    #[serde(default = "default_backup")]
    pub backup: ChannelConfig,
    #[serde(default = "default_restore")]
    pub restore: ChannelConfig,
}

/// Multicast group and port of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl ChannelConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

fn default_peer_id() -> u32 {
    1
}
fn default_protocol_version() -> String {
    dbs_core::PROTOCOL_VERSION.to_string()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_control() -> ChannelConfig {
    ChannelConfig {
        group: Ipv4Addr::new(239, 255, 60, 61),
        port: 45680,
    }
}
fn default_backup() -> ChannelConfig {
    ChannelConfig {
        group: Ipv4Addr::new(239, 255, 60, 62),
        port: 45681,
    }
}
fn default_restore() -> ChannelConfig {
    ChannelConfig {
        group: Ipv4Addr::new(239, 255, 60, 63),
        port: 45682,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            protocol_version: default_protocol_version(),
            storage_dir: default_storage_dir(),
            max_storage_bytes: 0,
            control: default_control(),
            backup: default_backup(),
            restore: default_restore(),
        }
    }
}

impl Config {
    /// Apply `DBS_*` overrides. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = var("DBS_PEER_ID").and_then(|s| s.parse().ok()) {
            self.peer_id = p;
        }
        if let Some(dir) = var("DBS_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(n) = var("DBS_MAX_STORAGE_BYTES").and_then(|s| s.parse().ok()) {
            self.max_storage_bytes = n;
        }
    }

    /// Validate and convert into the core's configuration.
    pub fn core_config(&self) -> anyhow::Result<CoreConfig> {
        if self.peer_id == 0 {
            bail!("peer_id must be a positive integer");
        }
        let version: Version = self
            .protocol_version
            .parse()
            .with_context(|| format!("invalid protocol_version {:?}", self.protocol_version))?;
        let mut core = CoreConfig::new(PeerId(self.peer_id), &self.storage_dir);
        core.version = version;
        core.max_storage_bytes = self.max_storage_bytes;
        Ok(core)
    }
}

/// Load config: merge default, then config file, then env vars.
///
/// An explicit `path` must exist and parse; the default locations are skipped
/// silently when missing or invalid.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => {
            let s = std::fs::read_to_string(p)
                .with_context(|| format!("cannot read {}", p.display()))?;
            toml::from_str(&s).with_context(|| format!("invalid config {}", p.display()))?
        }
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dbs/config.toml"));
    }
    out.push(PathBuf::from("/etc/dbs/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
