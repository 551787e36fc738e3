//! TCP listener and connector producing [`StreamSession`]s.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigError};
use crate::endpoint::{
    Connector, ConnectorEvents, Listener, ListenerEvents, SessionCreated, SessionRef, Transport,
};
use crate::error::TransportError;
use crate::session::{Session, SessionMode};
use crate::transport::stream::StreamSession;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr, backlog: u32) -> tokio::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Transport factory for plain TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: AppConfig,
    addr: SocketAddr,
}

impl TcpTransport {
    /// Validate `config` and build the factory. Malformed addresses fail here.
    pub fn new(config: AppConfig) -> Result<Self, ConfigError> {
        let addr = config.validate()?;
        Ok(Self { config, addr })
    }

    /// Resolved address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Configuration shared by every session this transport creates
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl Transport for TcpTransport {
    fn create_listener(&self, on_session: SessionCreated) -> Arc<dyn Listener> {
        Arc::new(TcpListenerEndpoint::new(
            self.config.clone(),
            self.addr,
            on_session,
        ))
    }

    fn create_connector(&self, on_session: SessionCreated) -> Arc<dyn Connector> {
        Arc::new(TcpConnector::new(self.config.clone(), self.addr, on_session))
    }
}

struct ListenerShared {
    config: AppConfig,
    on_session: SessionCreated,
    events: ListenerEvents,
    active: AtomicUsize,
}

impl ListenerShared {
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let active = self.active.load(Ordering::Acquire);
        if active >= self.config.max_connections {
            warn!(
                "Refusing connection from {}: {} of {} sessions active",
                peer, active, self.config.max_connections
            );
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let session = StreamSession::new(stream, SessionMode::Server, Some(peer), &self.config);
        self.active.fetch_add(1, Ordering::AcqRel);
        self.watch_session(&session);

        (self.on_session)(session.clone());
        if !session.start() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn watch_session(self: &Arc<Self>, session: &Arc<StreamSession>) {
        let weak: Weak<StreamSession> = Arc::downgrade(session);

        let shared = self.clone();
        let connected = weak.clone();
        session.hooks().on_connected(move || {
            if let Some(session) = connected.upgrade() {
                let session: SessionRef = session;
                shared.events.connected.emit(&session);
            }
        });

        let shared = self.clone();
        session.hooks().on_disconnected(move |_| {
            shared.active.fetch_sub(1, Ordering::AcqRel);
            if let Some(session) = weak.upgrade() {
                let session: SessionRef = session;
                shared.events.disconnected.emit(&session);
            }
        });
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// TCP listener: `Created -> Listening -> Stopped`
pub struct TcpListenerEndpoint {
    addr: SocketAddr,
    shared: Arc<ListenerShared>,
    running: tokio::sync::Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpListenerEndpoint {
    /// Create a listener for `addr`; nothing is bound until [`Listener::start`]
    pub fn new(config: AppConfig, addr: SocketAddr, on_session: SessionCreated) -> Self {
        Self {
            addr,
            shared: Arc::new(ListenerShared {
                config,
                on_session,
                events: ListenerEvents::default(),
                active: AtomicUsize::new(0),
            }),
            running: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Number of accepted sessions not yet disconnected
    pub fn active_sessions(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    async fn accept_loop(
        shared: Arc<ListenerShared>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        shared.admit(stream, peer);
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Listener for TcpListenerEndpoint {
    async fn start(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(TransportError::AlreadyListening);
        }

        let listener = listen_tcp(self.addr, self.shared.config.listener_backlog).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::accept_loop(
            self.shared.clone(),
            listener,
            cancel.clone(),
        ));

        *running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        *self.local_addr.lock() = Some(local_addr);
        drop(running);

        if self.is_listening() {
            info!("Listening on {}", local_addr);
            self.shared.events.started.emit(&());
        }
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        *self.local_addr.lock() = None;

        info!("Stopped listening on {}", running.local_addr);
        self.shared.events.stopped.emit(&());
    }

    fn is_listening(&self) -> bool {
        self.local_addr.lock().is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn events(&self) -> &ListenerEvents {
        &self.shared.events
    }
}

struct ConnectorShared {
    events: ConnectorEvents,
    session: Mutex<Option<SessionRef>>,
}

/// TCP connector yielding at most one client session
pub struct TcpConnector {
    config: AppConfig,
    addr: SocketAddr,
    on_session: SessionCreated,
    shared: Arc<ConnectorShared>,
    attempt: tokio::sync::Mutex<bool>,
}

impl TcpConnector {
    /// Create a connector for `addr`
    pub fn new(config: AppConfig, addr: SocketAddr, on_session: SessionCreated) -> Self {
        Self {
            config,
            addr,
            on_session,
            shared: Arc::new(ConnectorShared {
                events: ConnectorEvents::default(),
                session: Mutex::new(None),
            }),
            attempt: tokio::sync::Mutex::new(false),
        }
    }

    fn fail(&self, error: TransportError) -> TransportError {
        warn!("Failed to connect to {}: {}", self.addr, error);
        self.shared.events.connection_error.emit(&error.to_string());
        error
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<SessionRef, TransportError> {
        let mut produced = self.attempt.lock().await;
        if *produced {
            return Err(TransportError::AlreadyConnected);
        }

        info!("Attempting to connect to {}", self.addr);
        let timeout = self.config.connection_timeout();
        let stream = match tokio::time::timeout(timeout, connect_tcp(self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Err(_) => {
                return Err(self.fail(TransportError::ConnectTimeout {
                    addr: self.addr,
                    timeout_ms: self.config.connection_timeout_ms,
                }))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", self.addr, e);
        }

        let session = StreamSession::new(
            stream,
            SessionMode::Client,
            Some(self.addr),
            &self.config,
        );
        *produced = true;

        let weak = Arc::downgrade(&session);
        let shared = self.shared.clone();
        session.hooks().on_connected({
            let weak = weak.clone();
            move || {
                if let Some(session) = weak.upgrade() {
                    let session: SessionRef = session;
                    *shared.session.lock() = Some(session.clone());
                    shared.events.connected.emit(&session);
                }
            }
        });
        let shared = self.shared.clone();
        session.hooks().on_disconnected(move |_| {
            if let Some(session) = weak.upgrade() {
                let session: SessionRef = session;
                shared.events.disconnected.emit(&session);
            }
        });

        (self.on_session)(session.clone());
        if !session.start() {
            return Err(self.fail(TransportError::Establishment(
                "session closed before start".to_string(),
            )));
        }
        info!("TCP connection established to {}", self.addr);
        Ok(session)
    }

    fn session(&self) -> Option<SessionRef> {
        self.shared.session.lock().clone()
    }

    fn events(&self) -> &ConnectorEvents {
        &self.shared.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn local_config() -> AppConfig {
        AppConfig {
            address: "127.0.0.1:0".to_string(),
            ..AppConfig::default()
        }
    }

    fn noop() -> SessionCreated {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = listen_tcp(addr, 16).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[test]
    fn test_malformed_address_reported_at_construction() {
        let config = AppConfig {
            address: "localhost".to_string(),
            ..AppConfig::default()
        };
        assert!(TcpTransport::new(config).is_err());
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let transport = TcpTransport::new(local_config()).unwrap();
        let listener = transport.create_listener(noop());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = tx.clone();
        listener.events().started.subscribe(move |_| {
            let _ = started.send("started");
        });
        listener.events().stopped.subscribe(move |_| {
            let _ = tx.send("stopped");
        });

        assert!(!listener.is_listening());
        listener.start().await.unwrap();
        assert!(listener.is_listening());
        assert!(matches!(
            listener.start().await,
            Err(TransportError::AlreadyListening)
        ));

        listener.stop().await;
        assert!(!listener.is_listening());
        listener.stop().await;

        // Restart from Stopped
        listener.start().await.unwrap();
        listener.stop().await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen, vec!["started", "stopped", "started", "stopped"]);
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let transport = TcpTransport::new(local_config()).unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let listener = transport.create_listener(Arc::new(move |session: SessionRef| {
            let tx = server_tx.clone();
            session.hooks().set_on_received(move |data| {
                let _ = tx.send(data);
            });
        }));
        listener.start().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_config = AppConfig {
            address: addr.to_string(),
            ..AppConfig::default()
        };
        let connector = TcpTransport::new(client_config)
            .unwrap()
            .create_connector(noop());
        let session = connector.connect().await.unwrap();
        assert_eq!(session.mode(), SessionMode::Client);
        assert!(connector.session().is_some());
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::AlreadyConnected)
        ));

        session.send(Bytes::from_static(b"ping"), true).unwrap();
        let data = timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], b"ping");

        // Stopping the listener leaves the accepted session alone
        listener.stop().await;
        session.send(Bytes::from_static(b"pong"), true).unwrap();
        let data = timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], b"pong");
    }

    #[tokio::test]
    async fn test_listener_republishes_session_events() {
        let transport = TcpTransport::new(local_config()).unwrap();
        let listener = transport.create_listener(noop());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connected = tx.clone();
        listener.events().connected.subscribe(move |session: &SessionRef| {
            let _ = connected.send(("connected", session.id()));
        });
        listener.events().disconnected.subscribe(move |session: &SessionRef| {
            let _ = tx.send(("disconnected", session.id()));
        });
        listener.start().await.unwrap();

        let addr = listener.local_addr().unwrap();
        let connector = TcpTransport::new(AppConfig {
            address: addr.to_string(),
            ..AppConfig::default()
        })
        .unwrap()
        .create_connector(noop());
        let client = connector.connect().await.unwrap();

        let (kind, id) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "connected");

        client.disconnect();
        let (kind, closed_id) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "disconnected");
        assert_eq!(closed_id, id);
    }

    #[tokio::test]
    async fn test_connection_error_event() {
        // Bind then drop to get a port with nothing listening
        let addr = {
            let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
            listener.local_addr().unwrap()
        };
        let connector = TcpTransport::new(AppConfig {
            address: addr.to_string(),
            connection_timeout_ms: 1000,
            ..AppConfig::default()
        })
        .unwrap()
        .create_connector(noop());

        let (tx, mut rx) = mpsc::unbounded_channel();
        connector.events().connection_error.subscribe(move |error: &String| {
            let _ = tx.send(error.clone());
        });

        assert!(connector.connect().await.is_err());
        assert!(rx.try_recv().is_ok());
        assert!(connector.session().is_none());
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let transport = TcpTransport::new(AppConfig {
            max_connections: 1,
            ..local_config()
        })
        .unwrap();
        let listener = TcpListenerEndpoint::new(
            transport.config().clone(),
            transport.addr(),
            noop(),
        );
        listener.start().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let first = connect_tcp(addr).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while listener.active_sessions() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The second socket is accepted then closed immediately
        let mut second = connect_tcp(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(
            Duration::from_secs(2),
            tokio::io::AsyncReadExt::read(&mut second, &mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(listener.active_sessions(), 1);
        drop(first);
    }
}
