use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{PoolError, RelayUrl};

/// Relays used when nothing is configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

pub const DEFAULT_PRIMARY_RELAYS: usize = 1;
pub const DEFAULT_PRIMARY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_FALLBACK_TIMEOUT_SECS: u64 = 25;
pub const DEFAULT_EOSE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

/// Which [`RelayService`](crate::RelayService) implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayBackend {
    /// Real relays over WebSocket.
    #[default]
    Network,
    /// Local event store, no network.
    InMemory,
}

impl FromStr for RelayBackend {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" | "ws" | "websocket" => Ok(Self::Network),
            "memory" | "in-memory" | "inmemory" => Ok(Self::InMemory),
            other => Err(PoolError::Config(format!(
                "unknown relay backend {:?} (expected network or memory)",
                other
            ))),
        }
    }
}

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Relay endpoints in priority order. The first `primary_relays` are the
    /// primaries.
    pub relays: Vec<String>,
    pub primary_relays: usize,
    /// Per-attempt ceiling for primary relays.
    pub primary_timeout: Duration,
    /// Per-attempt ceiling for the remaining relays and the fallback sweep.
    pub fallback_timeout: Duration,
    /// How long `get_events` waits for every relay's EOSE.
    pub eose_timeout: Duration,
    /// How long `publish` waits for each relay's OK.
    pub publish_timeout: Duration,
    /// Drop incoming events whose id or signature does not verify.
    pub verify_events: bool,
    pub backend: RelayBackend,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            primary_relays: DEFAULT_PRIMARY_RELAYS,
            primary_timeout: Duration::from_secs(DEFAULT_PRIMARY_TIMEOUT_SECS),
            fallback_timeout: Duration::from_secs(DEFAULT_FALLBACK_TIMEOUT_SECS),
            eose_timeout: Duration::from_secs(DEFAULT_EOSE_TIMEOUT_SECS),
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
            verify_events: true,
            backend: RelayBackend::Network,
        }
    }
}

impl PoolConfig {
    pub fn new(relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: RelayBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Load configuration from `NOSTR_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, PoolError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("NOSTR_RELAYS") {
            let relays = parse_relays(&value);
            if !relays.is_empty() {
                config.relays = relays;
            }
        }
        if let Some(count) = env_number("NOSTR_PRIMARY_RELAYS")? {
            config.primary_relays = count as usize;
        }
        if let Some(secs) = env_number("NOSTR_CONNECT_TIMEOUT_SECS")? {
            config.primary_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number("NOSTR_FALLBACK_TIMEOUT_SECS")? {
            config.fallback_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number("NOSTR_EOSE_TIMEOUT_SECS")? {
            config.eose_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number("NOSTR_PUBLISH_TIMEOUT_SECS")? {
            config.publish_timeout = Duration::from_secs(secs);
        }
        if let Ok(value) = env::var("NOSTR_RELAY_BACKEND") {
            config.backend = value.parse()?;
        }

        Ok(config)
    }

    /// Validated relay urls in configured order, duplicates removed.
    pub fn relay_urls(&self) -> Result<Vec<RelayUrl>, PoolError> {
        let mut urls: Vec<RelayUrl> = Vec::with_capacity(self.relays.len());
        for relay in &self.relays {
            let url = RelayUrl::parse(relay)?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }
}

/// Split a relay list on commas and whitespace.
pub fn parse_relays(value: &str) -> Vec<String> {
    value
        .split(',')
        .flat_map(|chunk| chunk.split_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn env_number(name: &'static str) -> Result<Option<u64>, PoolError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| PoolError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relays_mixed_separators() {
        let relays = parse_relays("wss://a.example, wss://b.example\nwss://c.example,,");
        assert_eq!(
            relays,
            vec!["wss://a.example", "wss://b.example", "wss://c.example"]
        );
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.primary_relays, 1);
        assert_eq!(config.primary_timeout, Duration::from_secs(10));
        assert_eq!(config.fallback_timeout, Duration::from_secs(25));
        assert_eq!(config.eose_timeout, Duration::from_secs(5));
        assert_eq!(config.backend, RelayBackend::Network);
        assert!(!config.relays.is_empty());
    }

    #[test]
    fn test_relay_urls_dedup_and_validate() {
        let config = PoolConfig::new(["wss://a.example", "wss://a.example/", "ws://b.example"]);
        let urls = config.relay_urls().unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].as_str(), "wss://a.example");

        let bad = PoolConfig::new(["http://a.example"]);
        assert!(bad.relay_urls().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("memory".parse::<RelayBackend>().unwrap(), RelayBackend::InMemory);
        assert_eq!("Network".parse::<RelayBackend>().unwrap(), RelayBackend::Network);
        assert!("carrier-pigeon".parse::<RelayBackend>().is_err());
    }
}
