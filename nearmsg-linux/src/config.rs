//! Load config from file, then environment. CLI flags are applied on top in main.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/nearmsg/config.toml or /etc/nearmsg/config.toml.
/// Env overrides: NEARMSG_DISCOVERY_PORT, NEARMSG_GATT_PORT, NEARMSG_MTU, NEARMSG_RESTART_DELAY_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port advertisements are sent to and scanned on (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP port of the local GATT server (default 45691, 0 = pick any).
    #[serde(default = "default_gatt_port")]
    pub gatt_port: u16,
    /// Join the multicast group; turn off to rely on `peers` only.
    #[serde(default = "default_multicast")]
    pub multicast: bool,
    /// Extra unicast destinations for advertisements (e.g. a second daemon on this host).
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Largest MTU this radio accepts in the MTU exchange.
    #[serde(default = "default_max_mtu")]
    pub max_mtu: u16,
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    /// Engine tunables, `[engine]` table.
    #[serde(default)]
    pub engine: nearmsg_core::Config,
}

fn default_discovery_port() -> u16 {
    45690
}
fn default_gatt_port() -> u16 {
    45691
}
fn default_multicast() -> bool {
    true
}
fn default_max_mtu() -> u16 {
    nearmsg_core::protocol::REQUEST_MTU
}
fn default_advertise_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            gatt_port: default_gatt_port(),
            multicast: default_multicast(),
            peers: Vec::new(),
            max_mtu: default_max_mtu(),
            advertise_interval_ms: default_advertise_interval_ms(),
            engine: nearmsg_core::Config::default(),
        }
    }
}

impl Config {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }

    /// Apply `NEARMSG_*` overrides. Unparseable values are ignored.
    pub fn apply_env_with(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = parsed::<u16>(&var, "NEARMSG_DISCOVERY_PORT") {
            self.discovery_port = p;
        }
        if let Some(p) = parsed::<u16>(&var, "NEARMSG_GATT_PORT") {
            self.gatt_port = p;
        }
        if let Some(mtu) = parsed::<u16>(&var, "NEARMSG_MTU") {
            self.max_mtu = mtu;
        }
        if let Some(ms) = parsed::<u64>(&var, "NEARMSG_RESTART_DELAY_MS") {
            self.engine.restart_delay = Duration::from_millis(ms);
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|s| s.trim().parse().ok())
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env_with(|k| std::env::var(k).ok());
    c
}

/// Load an explicitly named file (a missing or invalid file is an error), then env vars.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut c: Config =
        toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    c.apply_env_with(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearmsg/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearmsg/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
