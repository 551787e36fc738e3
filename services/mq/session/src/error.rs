//! Error types for the session, transport and application layers.

use thiserror::Error;

/// Failure to hand bytes to a session.
///
/// `ExceedsBufferSize` is a contract violation: the caller built a payload
/// the session can never carry. Everything else is a transient condition of
/// the connection itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Payload larger than the configured buffer size
    #[error("payload of {len} bytes exceeds buffer size {limit}")]
    ExceedsBufferSize {
        /// Payload length
        len: usize,
        /// Configured buffer size
        limit: usize,
    },
    /// Session already closed or failed
    #[error("session closed")]
    Closed,
    /// Session has not finished connecting (TLS handshake pending)
    #[error("session not connected")]
    NotConnected,
    /// Record layer failed to write a queued payload; surfaces as the last send error
    #[error("tls error: {0}")]
    Tls(String),
}

impl SendError {
    /// Whether this error is a caller contract violation rather than an I/O condition
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, SendError::ExceedsBufferSize { .. })
    }
}

/// Transport level failures (bind, accept, connect)
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Connect did not complete in time
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// Target address
        addr: std::net::SocketAddr,
        /// Configured timeout
        timeout_ms: u64,
    },
    /// Listener is already listening
    #[error("listener already started")]
    AlreadyListening,
    /// Connector already produced its session
    #[error("connector already used")]
    AlreadyConnected,
    /// Session closed before the connection was fully established
    #[error("connection closed during establishment: {0}")]
    Establishment(String),
}
