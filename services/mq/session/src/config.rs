//! Application configuration shared by every layer of a session stack.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors, reported when a stack is assembled
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Address could not be parsed or resolved
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    /// A size or limit that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Per-stack configuration, copied into every session at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Largest payload a single send may carry, also the read chunk size
    pub buffer_size: usize,
    /// Upper bound for a single socket write (and an RPC round trip)
    pub send_timeout_ms: u64,
    /// Upper bound for establishing an outbound connection
    pub connection_timeout_ms: u64,
    /// Concurrent inbound sessions a listener accepts
    pub max_connections: usize,
    /// Pending connection queue length handed to listen(2)
    pub listener_backlog: u32,
    /// Listen or connect address, `host:port`
    pub address: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            send_timeout_ms: 30_000,
            connection_timeout_ms: 10_000,
            max_connections: 1024,
            listener_backlog: 128,
            address: "127.0.0.1:7700".to_string(),
        }
    }
}

impl AppConfig {
    /// Check limits and resolve the address
    pub fn validate(&self) -> Result<SocketAddr, ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Zero("buffer_size"));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::Zero("send_timeout_ms"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Zero("connection_timeout_ms"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        if self.listener_backlog == 0 {
            return Err(ConfigError::Zero("listener_backlog"));
        }
        self.socket_addr()
    }

    /// Resolve `address` to its first socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(addr) = self.address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        self.address
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidAddress(self.address.clone()))
    }

    /// Send timeout as a `Duration`
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Connection timeout as a `Duration`
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}
