//! Proxy configuration file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::proxy::ProxyOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// PEM certificate and private key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PemPair {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Proxy configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Interface whose inbound traffic is redirected.
    pub interface: String,

    /// Address the proxy listens on.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port redirected to the proxy (80 for HTTP, 443 for HTTPS).
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Rule script; relative paths are resolved against the config file.
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Certificate served by a TLS-terminating listener.
    #[serde(default)]
    pub tls: Option<PemPair>,

    /// Persistent CA for CONNECT tunnels. A fresh one is generated when
    /// absent.
    #[serde(default)]
    pub ca: Option<PemPair>,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Static upstream overrides, `host: "ip:port"`.
    #[serde(default)]
    pub resolve: HashMap<String, SocketAddr>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_public_port() -> u16 {
    80
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl ProxyConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Options for [`ProxyInstance::configure`](crate::ProxyInstance::configure).
    pub fn to_options(&self) -> ProxyOptions {
        let mut options = ProxyOptions::new(&self.address, self.proxy_port, self.public_port)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs));
        if let Some(script) = &self.script {
            options = options.with_script(script);
        }
        options.resolve = self.resolve.clone();
        options
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() || self.interface.chars().any(|c| c.is_whitespace()) {
            return Err(ConfigError::Invalid(format!(
                "invalid interface name {:?}",
                self.interface
            )));
        }

        if self.address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "invalid address {:?}",
                self.address
            )));
        }

        if self.public_port == 0 {
            return Err(ConfigError::Invalid("public_port must not be 0".to_string()));
        }

        for pair in [&self.tls, &self.ca].into_iter().flatten() {
            if pair.cert.as_os_str().is_empty() || pair.key.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "certificate and key paths must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        if let Some(script) = &mut self.script {
            resolve(script);
        }
        for pair in [&mut self.tls, &mut self.ca].into_iter().flatten() {
            resolve(&mut pair.cert);
            resolve(&mut pair.key);
        }
    }
}
