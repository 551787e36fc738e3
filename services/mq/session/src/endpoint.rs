//! Listener and connector roles, and the transport factory that makes them.
//!
//! A listener accepts inbound sessions; a connector creates at most one
//! outbound session. Both re-publish the lifecycle of the sessions they
//! produce through explicit event hubs. Stopping a listener does not close
//! sessions it already accepted: listener and session lifecycles are
//! independent.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TransportError;
use crate::event::EventHub;
use crate::session::Session;

/// Shared handle to any session layer
pub type SessionRef = Arc<dyn Session>;

/// Callback invoked exactly once per raw session a transport creates.
///
/// It runs before the session starts doing I/O, so the callee can install
/// its hooks without missing any bytes.
pub type SessionCreated = Arc<dyn Fn(SessionRef) + Send + Sync>;

/// Events published by a listener
#[derive(Debug, Default)]
pub struct ListenerEvents {
    /// Listening became active
    pub started: EventHub<()>,
    /// Listening stopped
    pub stopped: EventHub<()>,
    /// A session accepted by this listener connected
    pub connected: EventHub<SessionRef>,
    /// A session accepted by this listener disconnected
    pub disconnected: EventHub<SessionRef>,
}

/// Events published by a connector
#[derive(Debug, Default)]
pub struct ConnectorEvents {
    /// The outbound session connected
    pub connected: EventHub<SessionRef>,
    /// The outbound session disconnected
    pub disconnected: EventHub<SessionRef>,
    /// Connecting failed; carries the error text
    pub connection_error: EventHub<String>,
}

/// A bound, listening endpoint.
///
/// State machine: `Created -> Listening -> Stopped`, restartable from
/// `Stopped`.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Begin listening. Fires `started` once listening is verified active.
    async fn start(&self) -> Result<(), TransportError>;

    /// Stop accepting. Fires `stopped`. A no-op when not listening.
    async fn stop(&self);

    /// Whether the underlying socket is currently accepting
    fn is_listening(&self) -> bool;

    /// Bound address while listening
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Lifecycle events
    fn events(&self) -> &ListenerEvents;
}

/// A single outbound connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the session. A connector yields at most one session.
    async fn connect(&self) -> Result<SessionRef, TransportError>;

    /// The session, once connected
    fn session(&self) -> Option<SessionRef>;

    /// Lifecycle events
    fn events(&self) -> &ConnectorEvents;
}

/// Factory producing listeners and connectors bound to one transport
pub trait Transport: Send + Sync {
    /// Create a listener; `on_session` runs once per accepted raw session
    fn create_listener(&self, on_session: SessionCreated) -> Arc<dyn Listener>;

    /// Create a connector; `on_session` runs once for the raw session
    fn create_connector(&self, on_session: SessionCreated) -> Arc<dyn Connector>;
}
