//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::server::Liveness;

/// Relay configuration. File: ~/.config/webshare/relay.toml or /etc/webshare/relay.toml.
/// Env overrides: WEBSHARE_RELAY_HOST, WEBSHARE_RELAY_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default 8787).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between pings to each client (default 20).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// A client silent this long is treated as gone (default 60).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_ping_interval() -> u64 {
    20
}
fn default_idle_timeout() -> u64 {
    60
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> RelayConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut RelayConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(h) = var("WEBSHARE_RELAY_HOST") {
        if !h.is_empty() {
            c.host = h;
        }
    }
    if let Some(s) = var("WEBSHARE_RELAY_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid WEBSHARE_RELAY_PORT"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/webshare/relay.toml"));
    }
    out.push(PathBuf::from("/etc/webshare/relay.toml"));
    out
}

fn load_file() -> Option<RelayConfig> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<RelayConfig>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "invalid relay config; using defaults"),
                }
            }
            break;
        }
    }
    None
}
