//! Configuration handling for mq-node.
//!
//! Values come from a YAML file first, then `MQ_*` environment variables,
//! then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use mq_session::AppConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Session stack settings
    pub app: AppConfig,
    /// TLS material
    pub tls: TlsConfig,
    /// Calls issued in connect mode
    pub calls: CallsConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Server name presented by connectors, defaults to the connect host
    pub sni: Option<String>,
}

/// Connect-mode call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    pub count: usize,
    pub payload: String,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            count: 10,
            payload: "hello from mq".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from `path` and the process environment.
    ///
    /// A missing file yields defaults; a file that cannot be read or does not
    /// parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path));
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `MQ_*` overrides read through `lookup`; unparsable values are skipped
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("MQ_ADDRESS") {
            info!("Address overridden by environment: {}", address);
            self.app.address = address;
        }

        if let Some(value) = lookup("MQ_BUFFER_SIZE") {
            match value.parse::<usize>() {
                Ok(size) => {
                    self.app.buffer_size = size;
                    info!("Buffer size overridden by environment: {}", size);
                }
                Err(_) => warn!("Ignoring MQ_BUFFER_SIZE={:?}: not a number", value),
            }
        }

        if let Some(value) = lookup("MQ_MAX_CONNECTIONS") {
            match value.parse::<usize>() {
                Ok(limit) => {
                    self.app.max_connections = limit;
                    info!("Connection limit overridden by environment: {}", limit);
                }
                Err(_) => warn!("Ignoring MQ_MAX_CONNECTIONS={:?}: not a number", value),
            }
        }
    }
}
