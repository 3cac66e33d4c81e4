//! Service configuration
//!
//! Loaded once at startup from a YAML file. Two document shapes are accepted:
//! a bare list of routes, or a mapping with `server` settings and `routes`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/proxy.yaml";

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where rotation starts for each route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// Every route starts with its first credential
    #[default]
    Zero,
    /// Every route starts at a random credential, so replicas sharing one
    /// config don't hit the same upstream key in lockstep
    Random,
}

/// One configured client token
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CredentialRecord {
    /// Caller-facing token
    pub token: String,

    /// Upstream origin, e.g. "https://api.example.com"
    pub authority: String,

    /// Real upstream credentials, rotated in this order
    #[serde(default, alias = "auth_list")]
    pub credentials: Vec<String>,
}

/// Listener and transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub rotation_start: StartPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(300),
            rotation_start: StartPolicy::Zero,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub routes: Vec<CredentialRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawConfig {
    Routes(Vec<CredentialRecord>),
    Full(RawDocument),
}

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    server: RawServer,
    port: Option<u16>,
    #[serde(default)]
    routes: Vec<CredentialRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_secs: Option<u64>,
    response_timeout_secs: Option<u64>,
    #[serde(default)]
    rotation_start: StartPolicy,
}

impl Config {
    /// Load configuration using `KEYRELAY_CONFIG` (or the default path),
    /// then apply the `LISTEN` override.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("KEYRELAY_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut cfg = Self::from_file(&path)?;

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }

        Ok(cfg)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let cfg = match raw {
            RawConfig::Routes(routes) => Self {
                server: ServerConfig::default(),
                routes,
            },
            RawConfig::Full(doc) => Self::from_document(doc),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn from_document(doc: RawDocument) -> Self {
        let defaults = ServerConfig::default();
        let host = doc.server.host.unwrap_or_else(|| "0.0.0.0".to_string());
        let port = doc.server.port.or(doc.port).unwrap_or(3000);

        let server = ServerConfig {
            listen_addr: format!("{}:{}", host, port),
            connect_timeout: doc
                .server
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            response_timeout: doc
                .server
                .response_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.response_timeout),
            rotation_start: doc.server.rotation_start,
        };

        Self {
            server,
            routes: doc.routes,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, route) in self.routes.iter().enumerate() {
            if route.token.is_empty() {
                return Err(ConfigError::Invalid(format!("route #{} has an empty token", i)));
            }

            let url = url::Url::parse(&route.authority).map_err(|e| {
                ConfigError::Invalid(format!(
                    "route #{} has an invalid authority '{}': {}",
                    i, route.authority, e
                ))
            })?;

            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "route #{} authority '{}' must be an http(s) URL with a host",
                    i, route.authority
                )));
            }
        }

        Ok(())
    }
}
