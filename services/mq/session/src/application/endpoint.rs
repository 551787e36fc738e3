//! Application listener and connector over any [`Transport`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::session::AppSession;
use super::Security;
use crate::config::AppConfig;
use crate::endpoint::{
    Connector, ConnectorEvents, Listener, ListenerEvents, SessionCreated, SessionRef, Transport,
};
use crate::error::TransportError;
use crate::session::{Session, SessionState};

/// Transport factory wrapping every raw session in an [`AppSession`]
pub struct AppTransport {
    inner: Arc<dyn Transport>,
    config: AppConfig,
    security: Security,
}

impl AppTransport {
    /// Layer `security` over `inner`
    pub fn new(inner: Arc<dyn Transport>, config: AppConfig, security: Security) -> Self {
        Self {
            inner,
            config,
            security,
        }
    }

    /// Create a listener whose accepted sessions are application sessions
    pub fn listener(&self, on_session: SessionCreated) -> Arc<AppListener> {
        let shared = Arc::new(ListenerShared {
            events: ListenerEvents::default(),
            sessions: Mutex::new(HashMap::new()),
        });

        let config = self.config.clone();
        let security = self.security.clone();
        let weak_shared = Arc::downgrade(&shared);
        let inner = self.inner.create_listener(Arc::new(move |raw: SessionRef| {
            let Some(shared) = weak_shared.upgrade() else {
                raw.disconnect();
                return;
            };
            let session = AppSession::new(raw.clone(), &config, &security);
            shared.adopt(&raw, &session);
            on_session(session);
        }));

        let started = Arc::downgrade(&shared);
        inner.events().started.subscribe(move |_| {
            if let Some(shared) = started.upgrade() {
                shared.events.started.emit(&());
            }
        });
        let stopped = Arc::downgrade(&shared);
        inner.events().stopped.subscribe(move |_| {
            if let Some(shared) = stopped.upgrade() {
                shared.events.stopped.emit(&());
            }
        });

        Arc::new(AppListener { inner, shared })
    }

    /// Create a connector producing one application session
    pub fn connector(&self, on_session: SessionCreated) -> Arc<AppConnector> {
        let shared = Arc::new(ConnectorShared {
            events: ConnectorEvents::default(),
            created: Mutex::new(None),
            session: Mutex::new(None),
        });

        let config = self.config.clone();
        let security = self.security.clone();
        let weak_shared = Arc::downgrade(&shared);
        let inner = self.inner.create_connector(Arc::new(move |raw: SessionRef| {
            let Some(shared) = weak_shared.upgrade() else {
                raw.disconnect();
                return;
            };
            let session = AppSession::new(raw, &config, &security);
            shared.adopt(&session);
            on_session(session);
        }));

        let failed = Arc::downgrade(&shared);
        inner.events().connection_error.subscribe(move |error: &String| {
            if let Some(shared) = failed.upgrade() {
                shared.events.connection_error.emit(error);
            }
        });

        Arc::new(AppConnector {
            inner,
            shared,
            timeout: self.config.connection_timeout(),
        })
    }
}

impl Transport for AppTransport {
    fn create_listener(&self, on_session: SessionCreated) -> Arc<dyn Listener> {
        self.listener(on_session)
    }

    fn create_connector(&self, on_session: SessionCreated) -> Arc<dyn Connector> {
        self.connector(on_session)
    }
}

struct ListenerShared {
    events: ListenerEvents,
    /// Keeps accepted sessions alive until their transport disconnects
    sessions: Mutex<HashMap<u64, Arc<AppSession>>>,
}

impl ListenerShared {
    fn adopt(self: &Arc<Self>, raw: &SessionRef, session: &Arc<AppSession>) {
        self.sessions.lock().insert(raw.id(), session.clone());

        let weak = Arc::downgrade(session);
        let shared = Arc::downgrade(self);
        session.hooks().on_connected({
            let weak = weak.clone();
            let shared = shared.clone();
            move || {
                if let (Some(session), Some(shared)) = (weak.upgrade(), shared.upgrade()) {
                    let session: SessionRef = session;
                    shared.events.connected.emit(&session);
                }
            }
        });
        session.hooks().on_disconnected(move |_| {
            if let (Some(session), Some(shared)) = (weak.upgrade(), shared.upgrade()) {
                let session: SessionRef = session;
                shared.events.disconnected.emit(&session);
            }
        });

        // Handshake failures close the app session without a disconnected
        // event, so release on the transport side instead
        let shared = Arc::downgrade(self);
        let raw_id = raw.id();
        raw.hooks().on_disconnected(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.sessions.lock().remove(&raw_id);
            }
        });
    }
}

/// Listener publishing application sessions
pub struct AppListener {
    inner: Arc<dyn Listener>,
    shared: Arc<ListenerShared>,
}

impl AppListener {
    /// Number of live application sessions accepted by this listener
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Snapshot of the live application sessions
    pub fn sessions(&self) -> Vec<Arc<AppSession>> {
        self.shared.sessions.lock().values().cloned().collect()
    }
}

#[async_trait]
impl Listener for AppListener {
    async fn start(&self) -> Result<(), TransportError> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }

    fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn events(&self) -> &ListenerEvents {
        &self.shared.events
    }
}

struct ConnectorShared {
    events: ConnectorEvents,
    created: Mutex<Option<Arc<AppSession>>>,
    session: Mutex<Option<SessionRef>>,
}

impl ConnectorShared {
    fn adopt(self: &Arc<Self>, session: &Arc<AppSession>) {
        *self.created.lock() = Some(session.clone());

        let weak: Weak<AppSession> = Arc::downgrade(session);
        let shared = Arc::downgrade(self);
        session.hooks().on_connected({
            let weak = weak.clone();
            let shared = shared.clone();
            move || {
                if let (Some(session), Some(shared)) = (weak.upgrade(), shared.upgrade()) {
                    let session: SessionRef = session;
                    *shared.session.lock() = Some(session.clone());
                    shared.events.connected.emit(&session);
                }
            }
        });
        session.hooks().on_disconnected(move |_| {
            if let (Some(session), Some(shared)) = (weak.upgrade(), shared.upgrade()) {
                let session: SessionRef = session;
                shared.events.disconnected.emit(&session);
            }
        });
    }
}

/// Connector yielding one application session.
///
/// `connect` returns once the application session is usable, which for TLS
/// means after the handshake.
pub struct AppConnector {
    inner: Arc<dyn Connector>,
    shared: Arc<ConnectorShared>,
    timeout: std::time::Duration,
}

impl AppConnector {
    fn fail(&self, error: TransportError) -> TransportError {
        warn!("Application session failed to establish: {}", error);
        self.shared.events.connection_error.emit(&error.to_string());
        error
    }

    /// The application session, once connected
    pub fn app_session(&self) -> Option<Arc<AppSession>> {
        self.shared
            .created
            .lock()
            .clone()
            .filter(|session| session.is_connected())
    }
}

#[async_trait]
impl Connector for AppConnector {
    async fn connect(&self) -> Result<SessionRef, TransportError> {
        self.inner.connect().await?;

        let Some(session) = self.shared.created.lock().clone() else {
            return Err(self.fail(TransportError::Establishment(
                "transport produced no session".to_string(),
            )));
        };

        let reached = tokio::time::timeout(self.timeout, session.wait_established()).await;
        match reached {
            Ok(SessionState::Connected) => {
                info!(
                    session = session.id(),
                    tls = session.is_tls(),
                    "Application session established"
                );
                Ok(session as SessionRef)
            }
            Ok(state) => {
                debug!(session = session.id(), ?state, "Establishment ended");
                Err(self.fail(TransportError::Establishment(format!(
                    "session ended in state {:?}",
                    state
                ))))
            }
            Err(_) => {
                session.disconnect();
                Err(self.fail(TransportError::Establishment(
                    "timed out waiting for the session to establish".to_string(),
                )))
            }
        }
    }

    fn session(&self) -> Option<SessionRef> {
        self.shared.session.lock().clone()
    }

    fn events(&self) -> &ConnectorEvents {
        &self.shared.events
    }
}
