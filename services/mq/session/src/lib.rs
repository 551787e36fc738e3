//! Session, listener and connector layers for mq.
//!
//! This crate provides the layered session stack the RPC layer runs on:
//! transport sessions bound to sockets, application sessions adding policy
//! on top, and an optional TLS sub-layer spliced in through an in-memory
//! stream adapter.
//!
//! ## Features
//!
//! - **Session capability**: one [`Session`] trait implemented by every layer
//! - **Transport**: TCP listener and connector, plus in-memory pipe pairs
//! - **Application layer**: buffer-size enforcement and traffic logging
//! - **TLS**: rustls over an [`InnerStream`], enabled by the `tls` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use mq_session::{AppConfig, AppTransport, Listener, Security, SessionRef, TcpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AppConfig::default();
//! let tcp = TcpTransport::new(config.clone())?;
//! let app = AppTransport::new(Arc::new(tcp), config, Security::Transparent);
//!
//! let listener = app.listener(Arc::new(|session: SessionRef| {
//!     let echo = Arc::downgrade(&session);
//!     session.hooks().set_on_received(move |data| {
//!         if let Some(session) = echo.upgrade() {
//!             let _ = session.send(data, true);
//!         }
//!     });
//! }));
//! listener.start().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod application;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod inner_stream;
pub mod session;
pub mod transport;

// Re-export main types
pub use application::{AppConnector, AppListener, AppSession, AppTransport, Security};
pub use config::{AppConfig, ConfigError};
pub use endpoint::{
    Connector, ConnectorEvents, Listener, ListenerEvents, SessionCreated, SessionRef, Transport,
};
pub use error::{SendError, TransportError};
pub use event::EventHub;
pub use inner_stream::{InnerStream, InnerStreamError, WriteFn};
pub use session::{
    next_session_id, Session, SessionCore, SessionHooks, SessionMode, SessionState,
};
pub use transport::{
    connect_tcp, listen_tcp, stream_pair, SessionStats, StreamSession, TcpConnector,
    TcpListenerEndpoint, TcpTransport,
};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use application::tls::{make_client_config, make_server_config, TlsSettings};
