//! Bus endpoint configuration.
//!
//! Defaults can be overridden from the environment (`IPCBUS_HOST`,
//! `IPCBUS_PORT`, `IPCBUS_BIND`) or from a TOML file with the same keys.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EventBusError;

/// Well-known bus port
pub const DEFAULT_PORT: u16 = 56789;

/// Host a client connects to by default
pub const DEFAULT_HOST: &str = "localhost";

/// Address a server binds to by default
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Environment variable overriding the client host
pub const ENV_HOST: &str = "IPCBUS_HOST";

/// Environment variable overriding the port
pub const ENV_PORT: &str = "IPCBUS_PORT";

/// Environment variable overriding the server bind address
pub const ENV_BIND: &str = "IPCBUS_BIND";

/// Endpoint settings shared by remote bus builders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Host a client connects to.
    pub host: String,
    /// Port a client connects to or a server listens on.
    pub port: u16,
    /// Address a server binds to.
    pub bind_address: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
        }
    }
}

impl BusConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self, EventBusError> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self, EventBusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.is_empty()) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT).filter(|p| !p.is_empty()) {
            self.port = parse_port(&port)?;
        }
        if let Some(bind) = lookup(ENV_BIND).filter(|b| !b.is_empty()) {
            self.bind_address = bind;
        }
        Ok(self)
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, EventBusError> {
        toml::from_str(content)
            .map_err(|e| EventBusError::invalid_config(format!("Failed to parse config: {}", e)))
    }

    /// Load a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EventBusError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }
}

/// Parse a port number from a configuration value
pub fn parse_port(value: &str) -> Result<u16, EventBusError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| EventBusError::invalid_config(format!("Invalid port: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 56789);
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_env_overrides() {
        let config = BusConfig::default()
            .merge_env(lookup(&[(ENV_HOST, "10.0.0.2"), (ENV_PORT, "4000")]))
            .unwrap();
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.port, 4000);
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
    }

    #[test]
    fn test_bad_port_is_an_error() {
        let result = BusConfig::default().merge_env(lookup(&[(ENV_PORT, "http")]));
        assert!(matches!(result, Err(EventBusError::InvalidConfig { .. })));
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 6000\nbind_address = \"127.0.0.1\"").unwrap();

        let config = BusConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.host, DEFAULT_HOST);
    }
}
