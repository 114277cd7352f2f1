//! Load config from file and environment.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use log::warn;
use serde::Deserialize;

/// How exchanges reach peers connected to other server instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Single instance: the bridge only spans this process.
    #[default]
    Local,
    /// UDP multicast between instances on the same network.
    Multicast,
}

impl std::str::FromStr for BridgeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BridgeMode::Local),
            "multicast" => Ok(BridgeMode::Multicast),
            other => anyhow::bail!("unknown bridge mode {:?}", other),
        }
    }
}

/// Server configuration. File: ~/.config/rendezvous/config.toml or /etc/rendezvous/config.toml.
/// Env overrides: RENDEZVOUS_LISTEN, RENDEZVOUS_BRIDGE, RENDEZVOUS_MULTICAST_GROUP,
/// RENDEZVOUS_MULTICAST_PORT, RENDEZVOUS_EXCHANGE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP listen address (default 0.0.0.0:8000).
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub bridge: BridgeMode,
    /// Multicast group for the cross-instance bridge (default 239.255.60.61).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Multicast UDP port (default 45680).
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    /// Give up on an unpaired exchange after this many seconds. Unset: wait until the peer hangs up.
    #[serde(default)]
    pub exchange_timeout_secs: Option<u64>,
    /// Body for GET /get; `{query}` is replaced with the request's query string.
    #[serde(default)]
    pub install_script: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_multicast_port() -> u16 {
    45680
}
fn default_multicast_ttl() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bridge: BridgeMode::default(),
            multicast_group: default_multicast_group(),
            multicast_port: default_multicast_port(),
            multicast_ttl: default_multicast_ttl(),
            exchange_timeout_secs: None,
            install_script: None,
        }
    }
}

impl Config {
    /// Zero means no deadline, same as unset.
    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_secs
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }
}

/// Load config: default, then config file, then env vars.
/// An explicit `path` must exist and parse; the default locations are best effort.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

/// Apply environment overrides. Unparsable values are ignored with a warning.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    override_with(&lookup, "RENDEZVOUS_LISTEN", &mut c.listen);
    override_with(&lookup, "RENDEZVOUS_BRIDGE", &mut c.bridge);
    override_with(&lookup, "RENDEZVOUS_MULTICAST_GROUP", &mut c.multicast_group);
    override_with(&lookup, "RENDEZVOUS_MULTICAST_PORT", &mut c.multicast_port);
    let mut secs = 0u64;
    if override_with(&lookup, "RENDEZVOUS_EXCHANGE_TIMEOUT_SECS", &mut secs) {
        c.exchange_timeout_secs = (secs > 0).then_some(secs);
    }
}

fn override_with<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> bool {
    let Some(s) = lookup(key) else {
        return false;
    };
    match s.trim().parse::<T>() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => {
            warn!("ignoring {}={:?}: not a valid value", key, s);
            false
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/rendezvous/config.toml"));
    }
    out.push(PathBuf::from("/etc/rendezvous/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn load_default_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&p) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("{:#}; using defaults", e);
            None
        }
    }
}
