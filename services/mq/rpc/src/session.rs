//! RPC dispatch over one session.

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_session::{AppConfig, SessionRef, SessionState};
use mq_wire::{Frame, FrameDecoder, Request, Response, DEFAULT_MAX_FRAME_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::{RemoteError, RpcError};
use crate::service::Service;

type Reply = Result<Bytes, RemoteError>;

struct Inbound {
    decoder: FrameDecoder,
    buf: BytesMut,
}

struct Shared {
    session: SessionRef,
    chunk_size: usize,
    call_timeout: Duration,
    max_frame_size: usize,
    inbound: Mutex<Inbound>,
    services: DashMap<String, Arc<dyn Service>>,
    proxies: DashMap<String, Arc<RpcProxy>>,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    next_corr_id: AtomicU64,
    /// Keeps the chunks of one frame contiguous on the session
    send_lock: Mutex<()>,
}

/// Service and proxy registries bound to one session.
///
/// Registration is possible only while the session is connected. When it
/// disconnects both registries are emptied and every outstanding call fails
/// with [`RpcError::Disconnected`].
pub struct RpcSession {
    shared: Arc<Shared>,
}

impl RpcSession {
    /// Bind RPC dispatch to `session`, taking over its received hook.
    ///
    /// Frames are split into sends of at most `config.buffer_size` bytes and
    /// calls time out after `config.send_timeout_ms`.
    pub fn attach(session: SessionRef, config: &AppConfig) -> Self {
        let shared = Arc::new(Shared {
            session,
            chunk_size: config.buffer_size.max(1),
            call_timeout: config.send_timeout(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            inbound: Mutex::new(Inbound {
                decoder: FrameDecoder::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE),
                buf: BytesMut::new(),
            }),
            services: DashMap::new(),
            proxies: DashMap::new(),
            pending: DashMap::new(),
            next_corr_id: AtomicU64::new(1),
            send_lock: Mutex::new(()),
        });

        let hooks = shared.session.hooks();
        let weak = Arc::downgrade(&shared);
        hooks.set_on_received(move |data| {
            if let Some(shared) = weak.upgrade() {
                shared.on_received(data);
            }
        });
        let weak = Arc::downgrade(&shared);
        hooks.on_disconnected(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.on_disconnected();
            }
        });
        if shared.session.state().is_terminal() {
            shared.on_disconnected();
        }

        Self { shared }
    }

    /// The underlying session
    pub fn session(&self) -> &SessionRef {
        &self.shared.session
    }

    /// Register `service` under `name`
    pub fn register_service(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> Result<(), RpcError> {
        self.shared.register_service(name.into(), service)
    }

    /// Register `service` under `name` once the session connects.
    ///
    /// Registration happens inside the connected event, before any inbound
    /// request is dispatched. The registries and the session keep each
    /// other alive until the session disconnects.
    pub fn serve(&self, name: impl Into<String>, service: Arc<dyn Service>) {
        let name = name.into();
        let done = Arc::new(AtomicBool::new(false));
        let register = {
            let shared = self.shared.clone();
            move || {
                if done.swap(true, Ordering::AcqRel) {
                    return;
                }
                if let Err(e) = shared.register_service(name.clone(), service.clone()) {
                    warn!(session = shared.session.id(), service = %name, "Failed to register service: {}", e);
                }
            }
        };
        let register = Arc::new(register);

        let deferred = register.clone();
        self.shared.session.hooks().on_connected(move || deferred());
        if self.shared.session.state() == SessionState::Connected {
            register();
        }
    }

    /// Remove the service registered under `name`
    pub fn unregister_service(&self, name: &str) -> bool {
        self.shared.services.remove(name).is_some()
    }

    /// Create and register a proxy for the remote service `name`
    pub fn register_proxy(&self, name: impl Into<String>) -> Result<Arc<RpcProxy>, RpcError> {
        self.shared.ensure_connected()?;
        let name = name.into();
        match self.shared.proxies.entry(name) {
            Entry::Occupied(entry) => Err(RpcError::DuplicateName(entry.key().clone())),
            Entry::Vacant(entry) => {
                let proxy = Arc::new(RpcProxy {
                    service: entry.key().clone(),
                    shared: Arc::downgrade(&self.shared),
                });
                debug!(session = self.shared.session.id(), service = %entry.key(), "Proxy registered");
                entry.insert(proxy.clone());
                Ok(proxy)
            }
        }
    }

    /// The proxy registered under `name`
    pub fn proxy(&self, name: &str) -> Result<Arc<RpcProxy>, RpcError> {
        self.shared
            .proxies
            .get(name)
            .map(|proxy| proxy.clone())
            .ok_or_else(|| RpcError::UnknownService(name.to_string()))
    }

    /// Names of the registered services
    pub fn service_names(&self) -> Vec<String> {
        self.shared.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of calls awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Shared {
    fn register_service(&self, name: String, service: Arc<dyn Service>) -> Result<(), RpcError> {
        self.ensure_connected()?;
        match self.services.entry(name) {
            Entry::Occupied(entry) => Err(RpcError::DuplicateName(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(session = self.session.id(), service = %entry.key(), "Service registered");
                entry.insert(service);
                Ok(())
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), RpcError> {
        match self.session.state() {
            SessionState::Connected => Ok(()),
            SessionState::Unknown => Err(RpcError::NotConnected),
            SessionState::Closed | SessionState::Error => Err(RpcError::Disconnected),
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), RpcError> {
        let encoded = frame.encode(self.max_frame_size)?;
        let _guard = self.send_lock.lock();
        let mut offset = 0;
        while offset < encoded.len() {
            let end = (offset + self.chunk_size).min(encoded.len());
            self.session
                .send(encoded.slice(offset..end), end == encoded.len())?;
            offset = end;
        }
        Ok(())
    }

    async fn call(&self, service: &str, method_id: u32, args: Bytes) -> Result<Bytes, RpcError> {
        self.ensure_connected()?;

        let corr_id = self.next_corr_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(corr_id, tx);
        // A disconnect racing the insert would never clear this entry
        if self.session.state().is_terminal() {
            self.pending.remove(&corr_id);
            return Err(RpcError::Disconnected);
        }

        let request = Frame::Request(Request {
            corr_id,
            service: service.to_string(),
            method_id,
            args,
        });
        if let Err(e) = self.send_frame(&request) {
            self.pending.remove(&corr_id);
            return Err(e);
        }
        trace!(session = self.session.id(), corr_id, service, method_id, "Call sent");

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(remote))) => Err(RpcError::Remote(remote)),
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.remove(&corr_id);
                warn!(session = self.session.id(), corr_id, service, method_id, "Call timed out");
                Err(RpcError::Timeout {
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn on_received(self: &Arc<Self>, data: Bytes) {
        let mut frames = Vec::new();
        let failed = {
            let mut inbound = self.inbound.lock();
            let Inbound { decoder, buf } = &mut *inbound;
            buf.extend_from_slice(&data);
            loop {
                match decoder.decode(buf) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                }
            }
        };

        for frame in frames {
            match frame {
                Frame::Request(request) => self.dispatch(request),
                Frame::Response(response) => self.complete(response),
            }
        }

        if let Some(e) = failed {
            warn!(session = self.session.id(), "Malformed frame, disconnecting: {}", e);
            self.session.disconnect();
        }
    }

    fn dispatch(self: &Arc<Self>, request: Request) {
        let service = self
            .services
            .get(&request.service)
            .map(|entry| entry.value().clone());
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let Request {
                corr_id,
                service: name,
                method_id,
                args,
            } = request;

            let body = match service {
                Some(service) => service.call(method_id, args).await,
                None => {
                    debug!(corr_id, service = %name, "Request for unknown service");
                    Err(RemoteError::unknown_service(&name))
                }
            };

            let Some(shared) = weak.upgrade() else { return };
            let response = Frame::Response(Response {
                corr_id,
                body: body.map_err(Into::into),
            });
            if let Err(e) = shared.send_frame(&response) {
                debug!(session = shared.session.id(), corr_id, "Failed to send response: {}", e);
            }
        });
    }

    fn complete(&self, response: Response) {
        let Some((_, tx)) = self.pending.remove(&response.corr_id) else {
            debug!(
                session = self.session.id(),
                corr_id = response.corr_id,
                "Response for unknown or expired call"
            );
            return;
        };
        let _ = tx.send(response.body.map_err(RemoteError::from));
    }

    fn on_disconnected(&self) {
        let pending = self.pending.len();
        self.services.clear();
        self.proxies.clear();
        // Dropping the senders fails every waiting call
        self.pending.clear();
        {
            let mut inbound = self.inbound.lock();
            inbound.buf.clear();
        }
        info!(session = self.session.id(), pending, "RPC registries cleared on disconnect");
    }
}

/// Local stand-in for a remote service
pub struct RpcProxy {
    service: String,
    shared: Weak<Shared>,
}

impl RpcProxy {
    /// Remote service name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke `method_id` remotely and await the correlated response
    pub async fn call(&self, method_id: u32, args: Bytes) -> Result<Bytes, RpcError> {
        let shared = self.shared.upgrade().ok_or(RpcError::Disconnected)?;
        shared.call(&self.service, method_id, args).await
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("service", &self.service)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mq_session::{stream_pair, AppSession, Security};
    use tokio::time::timeout;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn call(&self, method_id: u32, args: Bytes) -> Result<Bytes, RemoteError> {
            match method_id {
                1 => Ok(args),
                2 => Err(RemoteError::failure("rejected")),
                other => Err(RemoteError::unknown_method(other)),
            }
        }
    }

    struct Stall;

    #[async_trait]
    impl Service for Stall {
        async fn call(&self, _method_id: u32, args: Bytes) -> Result<Bytes, RemoteError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(args)
        }
    }

    fn rpc_pair(config: &AppConfig) -> (RpcSession, RpcSession) {
        let (server_raw, client_raw) = stream_pair(config);
        let server = AppSession::new(server_raw.clone(), config, &Security::Transparent);
        let client = AppSession::new(client_raw.clone(), config, &Security::Transparent);
        let server = RpcSession::attach(server, config);
        let client = RpcSession::attach(client, config);
        server_raw.start();
        client_raw.start();
        (server, client)
    }

    #[test]
    fn test_registration_requires_connection() {
        let config = AppConfig::default();
        let (server_raw, _client_raw) = stream_pair(&config);
        let rpc = RpcSession::attach(server_raw, &config);

        assert!(matches!(
            rpc.register_service("echo", Arc::new(Echo)),
            Err(RpcError::NotConnected)
        ));
        assert!(matches!(rpc.register_proxy("echo"), Err(RpcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_serve_registers_on_connect() {
        let config = AppConfig::default();
        let (server_raw, client_raw) = stream_pair(&config);
        let server = RpcSession::attach(server_raw.clone(), &config);
        let client = RpcSession::attach(client_raw.clone(), &config);
        server.serve("echo", Arc::new(Echo));
        assert!(server.service_names().is_empty());

        server_raw.start();
        client_raw.start();
        assert_eq!(server.service_names(), vec!["echo".to_string()]);

        // Already connected: registers immediately, and only once
        server.serve("echo2", Arc::new(Echo));
        assert_eq!(server.service_names().len(), 2);

        let proxy = client.register_proxy("echo").unwrap();
        let reply = proxy.call(1, Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(&reply[..], b"hi");
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let config = AppConfig::default();
        let (server, client) = rpc_pair(&config);

        server.register_service("echo", Arc::new(Echo)).unwrap();
        assert!(matches!(
            server.register_service("echo", Arc::new(Echo)),
            Err(RpcError::DuplicateName(name)) if name == "echo"
        ));

        client.register_proxy("echo").unwrap();
        assert!(matches!(
            client.register_proxy("echo"),
            Err(RpcError::DuplicateName(_))
        ));
        assert!(client.proxy("echo").is_ok());
        assert!(matches!(client.proxy("other"), Err(RpcError::UnknownService(_))));
    }

    #[tokio::test]
    async fn test_call_and_remote_error() {
        let config = AppConfig::default();
        let (server, client) = rpc_pair(&config);
        server.register_service("echo", Arc::new(Echo)).unwrap();
        let proxy = client.register_proxy("echo").unwrap();

        let reply = proxy.call(1, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(&reply[..], b"abc");

        match proxy.call(2, Bytes::new()).await {
            Err(RpcError::Remote(remote)) => {
                assert_eq!(remote.code, RemoteError::SERVICE_FAILURE);
                assert_eq!(remote.message, "rejected");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_service_reported_remotely() {
        let config = AppConfig::default();
        let (_server, client) = rpc_pair(&config);
        let proxy = client.register_proxy("missing").unwrap();

        match proxy.call(1, Bytes::new()).await {
            Err(RpcError::Remote(remote)) => assert_eq!(remote.code, RemoteError::UNKNOWN_SERVICE),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_larger_than_buffer_are_chunked() {
        let config = AppConfig {
            buffer_size: 64,
            ..AppConfig::default()
        };
        let (server, client) = rpc_pair(&config);
        server.register_service("echo", Arc::new(Echo)).unwrap();
        let proxy = client.register_proxy("echo").unwrap();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let reply = timeout(Duration::from_secs(5), proxy.call(1, Bytes::from(payload.clone())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let config = AppConfig {
            send_timeout_ms: 100,
            ..AppConfig::default()
        };
        let (server, client) = rpc_pair(&config);
        server.register_service("stall", Arc::new(Stall)).unwrap();
        let proxy = client.register_proxy("stall").unwrap();

        assert!(matches!(
            proxy.call(1, Bytes::new()).await,
            Err(RpcError::Timeout { timeout_ms: 100 })
        ));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_clears_registries() {
        let config = AppConfig::default();
        let (server, client) = rpc_pair(&config);
        server.register_service("stall", Arc::new(Stall)).unwrap();
        let proxy = client.register_proxy("stall").unwrap();

        let call = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.call(1, Bytes::new()).await })
        };
        timeout(Duration::from_secs(2), async {
            while client.pending_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.session().disconnect();
        let result = timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
        assert!(matches!(result, Err(RpcError::Disconnected)));
        assert!(matches!(client.proxy("stall"), Err(RpcError::UnknownService(_))));
        assert!(matches!(
            proxy.call(1, Bytes::new()).await,
            Err(RpcError::Disconnected)
        ));

        timeout(Duration::from_secs(2), async {
            while !server.service_names().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
