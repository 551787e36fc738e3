//! Application session: policy layer over one transport session.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, info, trace, warn};

#[cfg(feature = "tls")]
use tokio::sync::mpsc;
#[cfg(feature = "tls")]
use tokio_util::sync::CancellationToken;

use super::Security;
use crate::config::AppConfig;
use crate::endpoint::SessionRef;
use crate::error::SendError;
use crate::session::{Session, SessionCore, SessionHooks, SessionMode, SessionState};

#[cfg(feature = "tls")]
use super::tls::{self, TlsSettings};
#[cfg(feature = "tls")]
use crate::inner_stream::InnerStream;

#[cfg(feature = "tls")]
struct TlsPipe {
    settings: TlsSettings,
    inner: InnerStream,
    plain_tx: mpsc::UnboundedSender<Bytes>,
    plain_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    cancel: CancellationToken,
}

enum Pipe {
    Transparent,
    #[cfg(feature = "tls")]
    Tls(TlsPipe),
}

/// Session adding buffer-size enforcement, logging and an optional TLS
/// sub-layer on top of a transport session.
///
/// Holds the transport session for its whole life; the transport only sees
/// this session through weak references in its hooks.
pub struct AppSession {
    core: SessionCore,
    transport: SessionRef,
    buffer_size: usize,
    last_send_error: Mutex<Option<SendError>>,
    establishing: AtomicBool,
    pipe: Pipe,
}

impl AppSession {
    /// Wrap `transport`, installing this session's hooks on it.
    ///
    /// Call before the transport session starts so no bytes are missed. A
    /// transport that is already connected is picked up immediately.
    pub fn new(transport: SessionRef, config: &AppConfig, security: &Security) -> Arc<Self> {
        let pipe = match security {
            Security::Transparent => Pipe::Transparent,
            #[cfg(feature = "tls")]
            Security::Tls(settings) => {
                let writer = transport.clone();
                let inner = InnerStream::new(Arc::new(move |ciphertext| writer.send(ciphertext, true)));
                let (plain_tx, plain_rx) = mpsc::unbounded_channel();
                Pipe::Tls(TlsPipe {
                    settings: settings.clone(),
                    inner,
                    plain_tx,
                    plain_rx: Mutex::new(Some(plain_rx)),
                    cancel: CancellationToken::new(),
                })
            }
        };

        let session = Arc::new(Self {
            core: SessionCore::new(transport.mode()),
            transport,
            buffer_size: config.buffer_size,
            last_send_error: Mutex::new(None),
            establishing: AtomicBool::new(false),
            pipe,
        });
        session.attach();
        session
    }

    fn attach(self: &Arc<Self>) {
        let hooks = self.transport.hooks();

        let weak = Arc::downgrade(self);
        hooks.set_on_received(move |data| {
            if let Some(session) = weak.upgrade() {
                session.on_transport_received(data);
            }
        });

        if matches!(self.pipe, Pipe::Transparent) {
            let weak = Arc::downgrade(self);
            hooks.set_on_sent(move |len| {
                if let Some(session) = weak.upgrade() {
                    session.core.deliver_sent(len);
                }
            });
        }

        let weak = Arc::downgrade(self);
        hooks.on_connected(move || {
            if let Some(session) = weak.upgrade() {
                session.establish();
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        hooks.on_disconnected(move |state| {
            if let Some(session) = weak.upgrade() {
                let terminal = if state == SessionState::Error {
                    SessionState::Error
                } else {
                    SessionState::Closed
                };
                session.close(terminal);
            }
        });

        match self.transport.state() {
            SessionState::Connected => self.establish(),
            SessionState::Closed | SessionState::Error => self.close(SessionState::Closed),
            SessionState::Unknown => {}
        }
    }

    fn establish(self: &Arc<Self>) {
        if self.establishing.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.pipe {
            Pipe::Transparent => {
                if self.core.mark_connected() {
                    info!(
                        session = self.core.id(),
                        mode = %self.core.mode(),
                        transport = self.transport.id(),
                        "Application session connected"
                    );
                }
            }
            #[cfg(feature = "tls")]
            Pipe::Tls(pipe) => {
                let Some(plain_rx) = pipe.plain_rx.lock().take() else {
                    return;
                };
                tokio::spawn(tls::drive(
                    Arc::downgrade(self),
                    pipe.settings.clone(),
                    pipe.inner.clone(),
                    plain_rx,
                    pipe.cancel.clone(),
                    self.buffer_size,
                ));
            }
        }
    }

    fn on_transport_received(&self, data: Bytes) {
        trace!(
            session = self.core.id(),
            mode = %self.core.mode(),
            bytes = data.len(),
            "Received"
        );
        match &self.pipe {
            Pipe::Transparent => self.core.deliver_received(data),
            #[cfg(feature = "tls")]
            Pipe::Tls(pipe) => pipe.inner.received(data),
        }
    }

    fn stop_pipe(&self) {
        match &self.pipe {
            Pipe::Transparent => {}
            #[cfg(feature = "tls")]
            Pipe::Tls(pipe) => {
                pipe.cancel.cancel();
                pipe.inner.close();
            }
        }
    }

    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }

    /// Close with `terminal`, then tear the transport down
    pub(crate) fn close(&self, terminal: SessionState) {
        let Some(previous) = self.core.begin_close(terminal) else {
            return;
        };

        self.stop_pipe();

        // Own dispatch lock is not held here; the transport takes its own
        self.transport.disconnect();

        info!(
            session = self.core.id(),
            mode = %self.core.mode(),
            state = ?terminal,
            "Application session ended"
        );
        self.core.finish_close(previous);
    }

    /// Wait until the session connects or fails; returns the state reached
    pub async fn wait_established(&self) -> SessionState {
        self.core.wait_established().await
    }

    /// Configured maximum payload of a single send
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Most recent transient send failure
    pub fn last_send_error(&self) -> Option<SendError> {
        self.last_send_error.lock().clone()
    }

    pub(crate) fn record_send_error(&self, len: usize, err: SendError) {
        warn!(
            session = self.core.id(),
            mode = %self.core.mode(),
            bytes = len,
            "Send failed: {}",
            err
        );
        *self.last_send_error.lock() = Some(err);
    }

    /// The wrapped transport session
    pub fn transport(&self) -> &SessionRef {
        &self.transport
    }

    /// Whether payloads go through the TLS sub-layer
    pub fn is_tls(&self) -> bool {
        !matches!(self.pipe, Pipe::Transparent)
    }
}

impl Session for AppSession {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn mode(&self) -> SessionMode {
        self.core.mode()
    }

    fn state(&self) -> SessionState {
        self.core.state()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Send `data` after checking it against the buffer size.
    ///
    /// An oversized payload is a contract violation: logged at error level
    /// and returned, leaving the session usable. Other failures are recorded
    /// as the last send error, logged and returned.
    fn send(&self, data: Bytes, flush: bool) -> Result<(), SendError> {
        let len = data.len();
        if len > self.buffer_size {
            let err = SendError::ExceedsBufferSize {
                len,
                limit: self.buffer_size,
            };
            error!(
                session = self.core.id(),
                mode = %self.core.mode(),
                bytes = len,
                "Send rejected: {}",
                err
            );
            return Err(err);
        }

        let result = match &self.pipe {
            Pipe::Transparent => self.transport.send(data, flush),
            #[cfg(feature = "tls")]
            Pipe::Tls(pipe) => match self.core.state() {
                SessionState::Connected => {
                    pipe.plain_tx.send(data).map_err(|_| SendError::Closed)
                }
                SessionState::Unknown => Err(SendError::NotConnected),
                _ => Err(SendError::Closed),
            },
        };

        match &result {
            Ok(()) => trace!(
                session = self.core.id(),
                mode = %self.core.mode(),
                bytes = len,
                flush,
                "Sent"
            ),
            Err(e) => self.record_send_error(len, e.clone()),
        }
        result
    }

    fn disconnect(&self) {
        self.close(SessionState::Closed);
    }

    fn hooks(&self) -> &SessionHooks {
        self.core.hooks()
    }
}
