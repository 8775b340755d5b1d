//! Session configuration.

use serde::{Deserialize, Serialize};

/// Environment variable overriding the default host.
pub const HOST_ENV: &str = "RELAYLINK_HOST";
/// Environment variable overriding the default port.
pub const PORT_ENV: &str = "RELAYLINK_PORT";

/// Default host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default port.
pub const DEFAULT_PORT: u16 = 3000;

/// Where a session connects when `connect` leaves host or port unspecified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl SessionConfig {
    /// Defaults, overridden by `RELAYLINK_HOST` / `RELAYLINK_PORT` when set.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup. Blank values are ignored, as are
    /// ports that do not parse.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV).filter(|p| !p.trim().is_empty()) {
            match port.trim().parse::<u16>() {
                Ok(port) if port > 0 => self.port = port,
                _ => tracing::warn!("Ignoring invalid {PORT_ENV} value: {port:?}"),
            }
        }
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_overrides() {
        let config = SessionConfig::default()
            .with_overrides(lookup(&[(HOST_ENV, " 10.0.2.2 "), (PORT_ENV, "4000")]));
        assert_eq!(config.host, "10.0.2.2");
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let config =
            SessionConfig::default().with_overrides(lookup(&[(HOST_ENV, ""), (PORT_ENV, "http")]));
        assert_eq!(config, SessionConfig::default());

        let config = SessionConfig::default().with_overrides(lookup(&[(PORT_ENV, "0")]));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"port": 3100}"#).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 3100);
    }
}
