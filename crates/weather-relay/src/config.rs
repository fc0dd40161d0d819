//! Relay configuration.
//!
//! Settings come from the environment. `WEATHER_RELAY_CONFIG` may name a
//! YAML file holding base values; environment variables override it.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::provider::DEFAULT_API_URL;

/// `DEDUP_DB_PATH` value selecting the in-process store.
pub const MEMORY_STORE: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Zenoh endpoint (e.g. `tcp/127.0.0.1:7447`)
    pub zenoh_endpoint: String,
    /// `client` (through a router) or `peer`
    pub zenoh_mode: String,
    /// Provider base URL; `/weather` and `/forecast` are appended
    pub api_url: String,
    pub api_key: Option<String>,
    /// Inbound key expression
    pub requests_topic: String,
    /// Outbound key prefix; events go to `{weather_topic}/{city}`
    pub weather_topic: String,
    /// SQLite ledger path, or `:memory:` for a process-local ledger
    pub dedup_db_path: String,
    pub max_in_flight: usize,
    pub marker_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub drain_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            zenoh_endpoint: "tcp/127.0.0.1:7447".to_string(),
            zenoh_mode: "client".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            requests_topic: "requests".to_string(),
            weather_topic: "weather".to_string(),
            dedup_db_path: "pending_markers.db".to_string(),
            max_in_flight: 32,
            marker_ttl_secs: 300,
            fetch_timeout_secs: 10,
            publish_timeout_secs: 5,
            drain_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the configuration from the process environment and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Resolve against an arbitrary variable lookup.
    pub fn resolve<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("WEATHER_RELAY_CONFIG") {
            Some(path) => {
                log::info!("Loading config from {}", path);
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("ZENOH_ENDPOINT").or_else(|| lookup("BROKER_ENDPOINT")) {
            self.zenoh_endpoint = endpoint;
        }
        if let Some(mode) = lookup("ZENOH_MODE") {
            self.zenoh_mode = mode;
        }
        if let Some(url) = lookup("API_URL") {
            self.api_url = url;
        }
        if let Some(key) = lookup("WEATHER_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(topic) = lookup("REQUESTS_TOPIC") {
            self.requests_topic = topic;
        }
        if let Some(topic) = lookup("WEATHER_TOPIC") {
            self.weather_topic = topic;
        }
        if let Some(path) = lookup("DEDUP_DB_PATH") {
            self.dedup_db_path = path;
        }
        parse_override(lookup, "MAX_IN_FLIGHT", &mut self.max_in_flight)?;
        parse_override(lookup, "MARKER_TTL_SECS", &mut self.marker_ttl_secs)?;
        parse_override(lookup, "FETCH_TIMEOUT_SECS", &mut self.fetch_timeout_secs)?;
        parse_override(lookup, "PUBLISH_TIMEOUT_SECS", &mut self.publish_timeout_secs)?;
        parse_override(lookup, "DRAIN_TIMEOUT_SECS", &mut self.drain_timeout_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(ConfigError::Missing("WEATHER_API_KEY")),
        }
        if !matches!(self.zenoh_mode.as_str(), "client" | "peer") {
            return Err(ConfigError::Invalid {
                name: "ZENOH_MODE",
                value: self.zenoh_mode.clone(),
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_IN_FLIGHT",
                value: "0".to_string(),
            });
        }
        // A marker must outlive the lookup that holds it
        let lookup_bound = self.fetch_timeout_secs.saturating_add(self.publish_timeout_secs);
        if self.marker_ttl_secs <= lookup_bound {
            return Err(ConfigError::Invalid {
                name: "MARKER_TTL_SECS",
                value: format!(
                    "{} (must exceed FETCH_TIMEOUT_SECS + PUBLISH_TIMEOUT_SECS = {})",
                    self.marker_ttl_secs, lookup_bound
                ),
            });
        }
        if self.requests_topic.trim().is_empty() || self.weather_topic.trim().is_empty() {
            return Err(ConfigError::Missing("REQUESTS_TOPIC / WEATHER_TOPIC"));
        }
        Ok(())
    }

    /// The API key; only call after [`RelayConfig::validate`].
    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }

    pub fn uses_memory_store(&self) -> bool {
        self.dedup_db_path == MEMORY_STORE
    }

    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn parse_override<F, T>(lookup: &F, name: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resolve(vars: &HashMap<String, String>) -> Result<RelayConfig, ConfigError> {
        RelayConfig::resolve(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_with_api_key() {
        let config = resolve(&env(&[("WEATHER_API_KEY", "secret")])).unwrap();
        assert_eq!(config.zenoh_endpoint, "tcp/127.0.0.1:7447");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.requests_topic, "requests");
        assert_eq!(config.weather_topic, "weather");
        assert_eq!(config.api_key(), "secret");
        assert_eq!(config.marker_ttl(), Duration::from_secs(300));
        assert!(!config.uses_memory_store());
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let err = resolve(&env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("WEATHER_API_KEY")));

        let err = resolve(&env(&[("WEATHER_API_KEY", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("WEATHER_API_KEY")));
    }

    #[test]
    fn test_env_overrides() {
        let config = resolve(&env(&[
            ("WEATHER_API_KEY", "k"),
            ("BROKER_ENDPOINT", "tcp/broker:7447"),
            ("API_URL", "http://localhost:8080"),
            ("DEDUP_DB_PATH", ":memory:"),
            ("MAX_IN_FLIGHT", "4"),
            ("FETCH_TIMEOUT_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.zenoh_endpoint, "tcp/broker:7447");
        assert_eq!(config.api_url, "http://localhost:8080");
        assert!(config.uses_memory_store());
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_zenoh_endpoint_wins_over_broker_endpoint() {
        let config = resolve(&env(&[
            ("WEATHER_API_KEY", "k"),
            ("ZENOH_ENDPOINT", "tcp/a:1"),
            ("BROKER_ENDPOINT", "tcp/b:2"),
        ]))
        .unwrap();
        assert_eq!(config.zenoh_endpoint, "tcp/a:1");
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = resolve(&env(&[("WEATHER_API_KEY", "k"), ("MAX_IN_FLIGHT", "many")]))
            .unwrap_err();
        match err {
            ConfigError::Invalid { name, value } => {
                assert_eq!(name, "MAX_IN_FLIGHT");
                assert_eq!(value, "many");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        assert!(resolve(&env(&[("WEATHER_API_KEY", "k"), ("MAX_IN_FLIGHT", "0")])).is_err());
        assert!(resolve(&env(&[("WEATHER_API_KEY", "k"), ("MARKER_TTL_SECS", "0")])).is_err());
    }

    #[test]
    fn test_marker_ttl_must_exceed_lookup_timeouts() {
        let err = resolve(&env(&[("WEATHER_API_KEY", "k"), ("MARKER_TTL_SECS", "1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MARKER_TTL_SECS", .. }));

        // Default fetch (10 s) + publish (5 s) timeouts
        assert!(resolve(&env(&[("WEATHER_API_KEY", "k"), ("MARKER_TTL_SECS", "15")])).is_err());
        let config =
            resolve(&env(&[("WEATHER_API_KEY", "k"), ("MARKER_TTL_SECS", "16")])).unwrap();
        assert_eq!(config.marker_ttl(), Duration::from_secs(16));

        let config = resolve(&env(&[
            ("WEATHER_API_KEY", "k"),
            ("MARKER_TTL_SECS", "4"),
            ("FETCH_TIMEOUT_SECS", "2"),
            ("PUBLISH_TIMEOUT_SECS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.marker_ttl(), Duration::from_secs(4));
    }

    #[test]
    fn test_unknown_zenoh_mode_is_rejected() {
        let err = resolve(&env(&[("WEATHER_API_KEY", "k"), ("ZENOH_MODE", "router")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ZENOH_MODE", .. }));
    }

    #[test]
    fn test_yaml_file_with_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(
            &path,
            "api_key: from-file\nweather_topic: wind\nmax_in_flight: 8\n",
        )
        .unwrap();

        let config = resolve(&env(&[
            ("WEATHER_RELAY_CONFIG", path.to_str().unwrap()),
            ("MAX_IN_FLIGHT", "16"),
        ]))
        .unwrap();
        assert_eq!(config.api_key(), "from-file");
        assert_eq!(config.weather_topic, "wind");
        assert_eq!(config.max_in_flight, 16);
        // Unset keys keep their defaults
        assert_eq!(config.requests_topic, "requests");
    }

    #[test]
    fn test_missing_config_file() {
        let err = resolve(&env(&[("WEATHER_RELAY_CONFIG", "/nonexistent/relay.yaml")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = RelayConfig::parse("max_in_flight: [not, a, number]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
