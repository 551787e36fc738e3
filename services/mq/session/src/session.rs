//! Session capability interface and the shared state machine behind it.
//!
//! Every layer that "has a session" (transport, application, TLS) exposes the
//! same [`Session`] shape, so layers compose by wrapping an `Arc<dyn Session>`
//! rather than by inheritance.
//!
//! State moves monotonically `Unknown -> Connected -> {Closed | Error}`. On
//! close the received/sent hook slots are emptied before any `disconnected`
//! subscriber runs, and hook invocation is serialized with that transition, so
//! once `disconnect()` returns no hook of that session runs again.
//!
//! `disconnected` is emitted with no dispatch lock held. The remaining
//! cross-layer calls under a lock go one way per session pair: a transparent
//! application session is entered from its transport's delivery, a TLS one
//! only ever calls down into its transport.

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::SendError;
use crate::event::EventHub;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique session ID
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side of the connection a session is, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Accepted by a listener
    Server,
    /// Created by a connector
    Client,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Server => f.write_str("server"),
            SessionMode::Client => f.write_str("client"),
        }
    }
}

/// Lifecycle state of a session
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet connected
    Unknown = 0,
    /// Connected and usable
    Connected = 1,
    /// Closed normally
    Closed = 2,
    /// Closed because of a failure
    Error = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Unknown,
            1 => SessionState::Connected,
            2 => SessionState::Closed,
            _ => SessionState::Error,
        }
    }

    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

/// Hook receiving inbound bytes
pub type ReceivedHook = Arc<dyn Fn(Bytes) + Send + Sync>;
/// Hook receiving the size of a completed send
pub type SentHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Callback slots and event subscriptions of one session
#[derive(Default)]
pub struct SessionHooks {
    received: Mutex<Option<ReceivedHook>>,
    sent: Mutex<Option<SentHook>>,
    connected: EventHub<()>,
    disconnected: EventHub<SessionState>,
}

impl SessionHooks {
    /// Install the received-data callback, replacing any previous one
    pub fn set_on_received<F>(&self, hook: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        *self.received.lock() = Some(Arc::new(hook));
    }

    /// Install the send-completed callback, replacing any previous one
    pub fn set_on_sent<F>(&self, hook: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.sent.lock() = Some(Arc::new(hook));
    }

    /// Subscribe to the connected event
    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connected.subscribe(move |_| handler());
    }

    /// Subscribe to the disconnected event; the handler sees the final state
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        self.disconnected.subscribe(move |state| handler(*state));
    }

    /// Whether a received-data callback is installed
    pub fn has_received_hook(&self) -> bool {
        self.received.lock().is_some()
    }

    /// Whether a send-completed callback is installed
    pub fn has_sent_hook(&self) -> bool {
        self.sent.lock().is_some()
    }

    fn clear_callbacks(&self) {
        *self.received.lock() = None;
        *self.sent.lock() = None;
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("received", &self.has_received_hook())
            .field("sent", &self.has_sent_hook())
            .field("connected", &self.connected.len())
            .field("disconnected", &self.disconnected.len())
            .finish()
    }
}

/// A bidirectional, buffer-bounded point-to-point data channel
pub trait Session: Send + Sync {
    /// Process-unique ID
    fn id(&self) -> u64;

    /// Server or client, fixed at creation
    fn mode(&self) -> SessionMode;

    /// Current lifecycle state
    fn state(&self) -> SessionState;

    /// Remote address, when the session is backed by a socket
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Queue `data` for transmission.
    ///
    /// `flush` asks for best-effort immediate transmission; without it the
    /// bytes may be coalesced with later sends. Sends issued sequentially
    /// are transmitted in order.
    fn send(&self, data: Bytes, flush: bool) -> Result<(), SendError>;

    /// Tear the session down. Idempotent.
    fn disconnect(&self);

    /// Callback slots and event subscriptions
    fn hooks(&self) -> &SessionHooks;

    /// Whether the session is currently connected
    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }
}

/// State machine and hook dispatch shared by the concrete session types
pub struct SessionCore {
    id: u64,
    mode: SessionMode,
    state: AtomicU8,
    /// Serializes state transitions with hook and event dispatch
    dispatch: ReentrantMutex<()>,
    hooks: SessionHooks,
    watch: watch::Sender<SessionState>,
}

impl SessionCore {
    /// Create a core in the `Unknown` state
    pub fn new(mode: SessionMode) -> Self {
        let (watch, _) = watch::channel(SessionState::Unknown);
        Self {
            id: next_session_id(),
            mode,
            state: AtomicU8::new(SessionState::Unknown as u8),
            dispatch: ReentrantMutex::new(()),
            hooks: SessionHooks::default(),
            watch,
        }
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.watch.subscribe()
    }

    /// Wait until the session leaves `Unknown`; returns the state reached
    pub async fn wait_established(&self) -> SessionState {
        let mut rx = self.watch_state();
        let reached = match rx.wait_for(|state| *state != SessionState::Unknown).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    /// Session ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session mode
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Hooks of this session
    pub fn hooks(&self) -> &SessionHooks {
        &self.hooks
    }

    /// Move `Unknown -> Connected` and fire `connected`.
    ///
    /// Returns false, firing nothing, when the session is not in `Unknown`.
    pub fn mark_connected(&self) -> bool {
        let _guard = self.dispatch.lock();
        let moved = self
            .state
            .compare_exchange(
                SessionState::Unknown as u8,
                SessionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            self.watch.send_replace(SessionState::Connected);
            self.hooks.connected.emit(&());
        }
        moved
    }

    /// First half of a close: move to `terminal` and empty the hook slots.
    ///
    /// Returns the previous state on the first call, `None` afterwards. The
    /// caller tears down its resources and then calls [`Self::finish_close`].
    pub fn begin_close(&self, terminal: SessionState) -> Option<SessionState> {
        debug_assert!(terminal.is_terminal());
        let _guard = self.dispatch.lock();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if SessionState::from_u8(current).is_terminal() {
                return None;
            }
            match self.state.compare_exchange(
                current,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.hooks.clear_callbacks();
        self.watch.send_replace(terminal);
        Some(SessionState::from_u8(current))
    }

    /// Second half of a close: fire `disconnected` if the session had
    /// connected, then drop every subscriber.
    ///
    /// Runs without the dispatch lock. The state is already terminal, so no
    /// hook can start, and a `disconnected` handler may close the layer
    /// above, which takes that layer's own lock.
    pub fn finish_close(&self, previous: SessionState) {
        if previous == SessionState::Connected {
            self.hooks.disconnected.emit(&self.state());
        }
        self.hooks.connected.clear();
        self.hooks.disconnected.clear();
    }

    /// Hand inbound bytes to the received hook, if the session is still open
    pub fn deliver_received(&self, data: Bytes) {
        let _guard = self.dispatch.lock();
        if self.state().is_terminal() {
            return;
        }
        let hook = self.hooks.received.lock().clone();
        if let Some(hook) = hook {
            hook(data);
        }
    }

    /// Report a completed send to the sent hook, if the session is still open
    pub fn deliver_sent(&self, len: usize) {
        let _guard = self.dispatch.lock();
        if self.state().is_terminal() {
            return;
        }
        let hook = self.hooks.sent.lock().clone();
        if let Some(hook) = hook {
            hook(len);
        }
    }
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
