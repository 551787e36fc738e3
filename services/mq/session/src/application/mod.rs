//! Application layer: policy over transport sessions.
//!
//! Every raw session is wrapped 1:1 in an [`AppSession`] that enforces the
//! configured buffer size, logs traffic per session and either passes bytes
//! through unchanged or runs them through a TLS sub-layer.

pub mod endpoint;
pub mod session;
#[cfg(feature = "tls")]
pub mod tls;

pub use endpoint::{AppConnector, AppListener, AppTransport};
pub use session::AppSession;

/// Payload treatment between the application and transport sessions
#[derive(Debug, Clone, Default)]
pub enum Security {
    /// Bytes pass through unmodified
    #[default]
    Transparent,
    /// Bytes are carried inside a TLS session
    #[cfg(feature = "tls")]
    Tls(tls::TlsSettings),
}
