//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::fallback::Nat64Prefix;

/// Default shared identifier; override in production
const DEFAULT_USER_ID: &str = "86c50e3a-5b87-49dd-bd20-03c7f2735e40";

/// Default DNS-over-HTTPS endpoint
const DEFAULT_DOH_ENDPOINT: &str = "https://1.1.1.1/dns-query";

/// Default NAT64 translation prefix
const DEFAULT_NAT64_PREFIX: &str = "2602:fc59:b0:64::";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    fn validate(&self) -> Result<(), crate::Error> {
        self.server.user_id()?;
        self.server.nat64_prefixes()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Shared identifier clients must present, canonical dashed hex
    pub user_id: String,
    /// DNS-over-HTTPS query endpoint
    pub doh_endpoint: String,
    /// NAT64 prefixes for the fallback path; empty disables fallback
    pub nat64_prefixes: Vec<String>,
}

impl ServerConfig {
    /// Parse the shared identifier
    pub fn user_id(&self) -> Result<Uuid, crate::Error> {
        Uuid::parse_str(&self.user_id)
            .map_err(|e| crate::Error::Config(format!("Invalid user_id: {}", e)))
    }

    /// Parse the configured NAT64 prefixes
    pub fn nat64_prefixes(&self) -> Result<Vec<Nat64Prefix>, crate::Error> {
        self.nat64_prefixes
            .iter()
            .map(|p| {
                Nat64Prefix::parse(p)
                    .map_err(|e| crate::Error::Config(format!("Invalid NAT64 prefix: {}", e)))
            })
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            user_id: DEFAULT_USER_ID.to_string(),
            doh_endpoint: DEFAULT_DOH_ENDPOINT.to_string(),
            nat64_prefixes: vec![DEFAULT_NAT64_PREFIX.to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
