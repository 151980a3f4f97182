//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use share_core::{strategy::DEFAULT_DURABLE_LIMIT, DEFAULT_CHANNEL_CHUNK_SIZE, DEFAULT_RELAY_CHUNK_SIZE};
use tracing::warn;

use crate::transport::ReconnectPolicy;

/// Client configuration. File: ~/.config/webshare/client.toml or /etc/webshare/client.toml.
/// Env overrides: WEBSHARE_RELAY_URL, WEBSHARE_STORAGE_URL, WEBSHARE_DIRECT_HOST.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Relay base URL, e.g. ws://127.0.0.1:8787.
    pub relay_url: String,
    /// Durable storage worker base URL. Unset means durable storage is not configured.
    pub storage_url: Option<String>,
    pub durable_limit_bytes: u64,
    /// Use the public external hosts (0x0.st, then file.io).
    pub external_storage: bool,
    /// Address the direct connector listens on and advertises as its candidate.
    pub direct_host: String,
    pub channel_chunk_size: usize,
    pub relay_chunk_size: usize,
    /// Pause the peer-channel sender once this many chunks are buffered.
    pub buffer_threshold_chunks: usize,
    pub channel_chunk_delay_ms: u64,
    pub relay_chunk_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub negotiation_timeout_secs: u64,
    pub stall_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787".to_string(),
            storage_url: None,
            durable_limit_bytes: DEFAULT_DURABLE_LIMIT,
            external_storage: true,
            direct_host: "127.0.0.1".to_string(),
            channel_chunk_size: DEFAULT_CHANNEL_CHUNK_SIZE,
            relay_chunk_size: DEFAULT_RELAY_CHUNK_SIZE,
            buffer_threshold_chunks: 10,
            channel_chunk_delay_ms: 10,
            relay_chunk_delay_ms: 50,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            negotiation_timeout_secs: 15,
            stall_timeout_secs: 120,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base: Duration::from_millis(self.reconnect_base_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    pub fn buffer_threshold(&self) -> usize {
        self.channel_chunk_size
            .saturating_mul(self.buffer_threshold_chunks)
    }

    pub fn channel_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.channel_chunk_delay_ms)
    }

    pub fn relay_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.relay_chunk_delay_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> ClientConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(u) = var("WEBSHARE_RELAY_URL").filter(|s| !s.is_empty()) {
        c.relay_url = u;
    }
    if let Some(u) = var("WEBSHARE_STORAGE_URL") {
        c.storage_url = Some(u).filter(|s| !s.is_empty());
    }
    if let Some(h) = var("WEBSHARE_DIRECT_HOST").filter(|s| !s.is_empty()) {
        c.direct_host = h;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/webshare/client.toml"));
    }
    out.push(PathBuf::from("/etc/webshare/client.toml"));
    out
}

fn load_file() -> Option<ClientConfig> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<ClientConfig>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "invalid client config; using defaults"),
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = ClientConfig::default();
        assert_eq!(c.channel_chunk_size, 64 * 1024);
        assert_eq!(c.buffer_threshold(), 640 * 1024);
        assert_eq!(c.relay_chunk_size, 32_000);
        assert_eq!(c.negotiation_timeout(), Duration::from_secs(15));
        assert!(c.storage_url.is_none());
    }

    #[test]
    fn file_overrides_some_keys() {
        let c: ClientConfig = toml::from_str(
            r#"
            relay_url = "wss://relay.example"
            relay_chunk_delay_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.relay_url, "wss://relay.example");
        assert_eq!(c.relay_chunk_delay(), Duration::ZERO);
        assert_eq!(c.channel_chunk_delay_ms, 10);
    }

    #[test]
    fn env_overrides() {
        let mut c = ClientConfig::default();
        apply_env(&mut c, |k| match k {
            "WEBSHARE_RELAY_URL" => Some("ws://10.0.0.1:9000".into()),
            "WEBSHARE_STORAGE_URL" => Some("https://worker.example".into()),
            _ => None,
        });
        assert_eq!(c.relay_url, "ws://10.0.0.1:9000");
        assert_eq!(c.storage_url.as_deref(), Some("https://worker.example"));
        assert_eq!(c.direct_host, "127.0.0.1");
    }
}
