//! Transport session over any byte stream.
//!
//! A `StreamSession` owns one reader task and one writer task. Inbound bytes
//! are handed to the received hook in chunks of at most `buffer_size`.
//! Outbound sends go through a single FIFO drained by the writer task, so
//! sends from one caller reach the socket in order.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;
use crate::error::SendError;
use crate::session::{Session, SessionCore, SessionHooks, SessionMode, SessionState};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Statistics for a transport session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes written to the stream
    pub bytes_out: u64,
    /// Number of received chunks
    pub receives: u64,
    /// Number of sends accepted
    pub sends: u64,
    /// Timestamp of last received chunk
    pub last_in: Option<Instant>,
    /// Timestamp of last completed write
    pub last_out: Option<Instant>,
}

#[derive(Debug)]
struct Outbound {
    data: Bytes,
    flush: bool,
}

struct Pending {
    reader: BoxedRead,
    writer: BoxedWrite,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Raw session bound to a socket or any other duplex byte stream
pub struct StreamSession {
    core: SessionCore,
    peer: Option<SocketAddr>,
    buffer_size: usize,
    send_timeout: Duration,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<Option<Pending>>,
    shutdown: CancellationToken,
    stats: Mutex<SessionStats>,
}

impl StreamSession {
    /// Wrap `stream` in a session. No I/O happens until [`Self::start`].
    pub fn new<S>(
        stream: S,
        mode: SessionMode,
        peer: Option<SocketAddr>,
        config: &AppConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            core: SessionCore::new(mode),
            peer,
            buffer_size: config.buffer_size.max(1),
            send_timeout: config.send_timeout(),
            outbound_tx,
            pending: Mutex::new(Some(Pending {
                reader: Box::new(reader),
                writer: Box::new(writer),
                outbound_rx,
            })),
            shutdown: CancellationToken::new(),
            stats: Mutex::new(SessionStats::default()),
        })
    }

    /// Mark the session connected and spawn its I/O tasks.
    ///
    /// Must run inside a tokio runtime. Returns false when the session was
    /// already started or closed before starting.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };

        if !self.core.mark_connected() {
            debug!(session = self.core.id(), "Session closed before start");
            return false;
        }

        info!(
            session = self.core.id(),
            mode = %self.core.mode(),
            peer = ?self.peer,
            "Session connected"
        );

        tokio::spawn(self.clone().read_loop(pending.reader));
        tokio::spawn(self.clone().write_loop(pending.writer, pending.outbound_rx));
        true
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    fn close(&self, terminal: SessionState) {
        let Some(previous) = self.core.begin_close(terminal) else {
            return;
        };

        self.shutdown.cancel();
        self.pending.lock().take();

        info!(
            session = self.core.id(),
            mode = %self.core.mode(),
            state = ?terminal,
            "Session ended. Stats: {:?}",
            self.stats()
        );
        self.core.finish_close(previous);
    }

    async fn read_loop(self: Arc<Self>, mut reader: BoxedRead) {
        let mut chunk = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                result = reader.read(&mut chunk) => match result {
                    Ok(0) => {
                        debug!(session = self.core.id(), "EOF from peer");
                        self.close(SessionState::Closed);
                        break;
                    }
                    Ok(n) => {
                        {
                            let mut stats = self.stats.lock();
                            stats.bytes_in += n as u64;
                            stats.receives += 1;
                            stats.last_in = Some(Instant::now());
                        }
                        trace!(session = self.core.id(), mode = %self.core.mode(), bytes = n, "Received");
                        self.core.deliver_received(Bytes::copy_from_slice(&chunk[..n]));
                    }
                    Err(e) => {
                        warn!(session = self.core.id(), "Read error: {}", e);
                        self.close(SessionState::Error);
                        break;
                    }
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        writer: BoxedWrite,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut writer = BufWriter::with_capacity(self.buffer_size, writer);
        let mut unflushed: Vec<usize> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                message = outbound_rx.recv() => message,
                _ = self.shutdown.cancelled() => None,
            };
            let Some(message) = next else { break };

            if let Err(e) = self.write_message(&mut writer, &message).await {
                warn!(session = self.core.id(), "Write failed: {}", e);
                self.close(SessionState::Error);
                return;
            }
            unflushed.push(message.data.len());

            if message.flush || outbound_rx.is_empty() {
                if let Err(e) = self.flush(&mut writer).await {
                    warn!(session = self.core.id(), "Flush failed: {}", e);
                    self.close(SessionState::Error);
                    return;
                }
                for len in unflushed.drain(..) {
                    self.core.deliver_sent(len);
                }
            }
        }

        // Drain sends queued before the close, then shut the write half
        let mut drained = 0usize;
        while let Ok(message) = outbound_rx.try_recv() {
            if self.write_message(&mut writer, &message).await.is_err() {
                break;
            }
            drained += 1;
        }
        let shutdown = async {
            writer.flush().await?;
            writer.shutdown().await
        };
        if let Err(e) = tokio::time::timeout(self.send_timeout, shutdown)
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
        {
            debug!(session = self.core.id(), "Shutdown of write half failed: {}", e);
        }
        debug!(session = self.core.id(), drained, "Writer stopped");
    }

    async fn write_message(
        &self,
        writer: &mut BufWriter<BoxedWrite>,
        message: &Outbound,
    ) -> std::io::Result<()> {
        tokio::time::timeout(self.send_timeout, writer.write_all(&message.data))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

        let mut stats = self.stats.lock();
        stats.bytes_out += message.data.len() as u64;
        stats.last_out = Some(Instant::now());
        Ok(())
    }

    async fn flush(&self, writer: &mut BufWriter<BoxedWrite>) -> std::io::Result<()> {
        tokio::time::timeout(self.send_timeout, writer.flush())
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
    }
}

impl Session for StreamSession {
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
        self.peer
    }

    fn send(&self, data: Bytes, flush: bool) -> Result<(), SendError> {
        if self.core.state().is_terminal() {
            return Err(SendError::Closed);
        }
        let len = data.len();
        self.outbound_tx
            .send(Outbound { data, flush })
            .map_err(|_| SendError::Closed)?;
        self.stats.lock().sends += 1;
        trace!(session = self.core.id(), mode = %self.core.mode(), bytes = len, flush, "Queued send");
        Ok(())
    }

    fn disconnect(&self) {
        self.close(SessionState::Closed);
    }

    fn hooks(&self) -> &SessionHooks {
        self.core.hooks()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Two unstarted sessions joined by an in-memory pipe: `(server, client)`
pub fn stream_pair(config: &AppConfig) -> (Arc<StreamSession>, Arc<StreamSession>) {
    let (server_io, client_io) = tokio::io::duplex(config.buffer_size.max(1));
    (
        StreamSession::new(server_io, SessionMode::Server, None, config),
        StreamSession::new(client_io, SessionMode::Client, None, config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    fn collect_received(session: &StreamSession) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.hooks().set_on_received(move |data| {
            let _ = tx.send(data);
        });
        rx
    }

    async fn read_exactly(rx: &mut mpsc::UnboundedReceiver<Bytes>, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let chunk = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_pair_exchanges_bytes_in_order() {
        let config = AppConfig::default();
        let (server, client) = stream_pair(&config);
        let mut server_rx = collect_received(&server);

        assert!(server.start());
        assert!(client.start());
        assert!(!client.start());

        for i in 0..50u8 {
            client.send(Bytes::from(vec![i; 3]), i % 7 == 0).unwrap();
        }

        let received = read_exactly(&mut server_rx, 150).await;
        let expected: Vec<u8> = (0..50u8).flat_map(|i| [i, i, i]).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_reads_chunked_to_buffer_size() {
        let config = AppConfig {
            buffer_size: 4,
            ..AppConfig::default()
        };
        let (server, client) = stream_pair(&config);
        let mut server_rx = collect_received(&server);
        server.start();
        client.start();

        client.send(Bytes::from_static(b"0123456789"), true).unwrap();

        let mut total = Vec::new();
        while total.len() < 10 {
            let chunk = timeout(Duration::from_secs(2), server_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(chunk.len() <= 4);
            total.extend_from_slice(&chunk);
        }
        assert_eq!(total, b"0123456789");
    }

    #[tokio::test]
    async fn test_sent_hook_reports_lengths() {
        let config = AppConfig::default();
        let (server, client) = stream_pair(&config);
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        client.hooks().set_on_sent(move |len| {
            counter.fetch_add(len, Ordering::SeqCst);
        });
        let mut server_rx = collect_received(&server);
        server.start();
        client.start();

        client.send(Bytes::from_static(b"hello"), false).unwrap();
        client.send(Bytes::from_static(b"world!"), true).unwrap();
        read_exactly(&mut server_rx, 11).await;

        timeout(Duration::from_secs(2), async {
            while sent.load(Ordering::SeqCst) < 11 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_other_side() {
        let config = AppConfig::default();
        let (server, client) = stream_pair(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.hooks().on_disconnected(move |state| {
            let _ = tx.send(state);
        });
        server.start();
        client.start();

        client.disconnect();
        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(client.send(Bytes::from_static(b"x"), true), Err(SendError::Closed));

        let state = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, SessionState::Closed);
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let config = AppConfig::default();
        let (server, client) = stream_pair(&config);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        client.hooks().on_disconnected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        server.start();
        client.start();

        client.disconnect();
        client.disconnect();
        client.disconnect();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_sends_drained_on_disconnect() {
        let config = AppConfig::default();
        let (server, client) = stream_pair(&config);
        let mut server_rx = collect_received(&server);
        server.start();
        client.start();

        client.send(Bytes::from_static(b"last words"), false).unwrap();
        client.disconnect();

        assert_eq!(read_exactly(&mut server_rx, 10).await, b"last words");
    }
}
