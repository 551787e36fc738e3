//! Pull-based stream over push-delivered bytes.
//!
//! The network side calls [`InnerStream::received`] whenever bytes arrive;
//! the consumer reads them back through [`InnerStream::read`] or through the
//! [`AsyncRead`] impl, in exact arrival order. Bytes the consumer writes are
//! handed to a write callback. A TLS engine runs on top of this without
//! knowing the transport is callback driven.
//!
//! All queue mutation and the waiter handoff happen under one mutex. At most
//! one reader is outstanding at a time, whichever surface it reads through.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::SendError;

/// Failure of an inner stream read
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerStreamError {
    /// The read's cancellation token fired; the queue is unchanged
    #[error("read cancelled")]
    Cancelled,
    /// Another read is already outstanding
    #[error("a read is already in progress")]
    ConcurrentRead,
    /// The stream was closed and holds no more bytes
    #[error("inner stream closed")]
    Closed,
}

/// Callback receiving bytes written into the stream
pub type WriteFn = Arc<dyn Fn(Bytes) -> Result<(), SendError> + Send + Sync>;

struct Chunk {
    data: Bytes,
    pos: usize,
}

impl Chunk {
    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

#[derive(Default)]
struct Queue {
    chunks: VecDeque<Chunk>,
    waiter: Option<Waker>,
    closed: bool,
}

impl Queue {
    /// Copy as many queued bytes as fit, crossing chunk boundaries
    fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let src = head.remaining();
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
            head.pos += n;
            if head.pos == head.data.len() {
                self.chunks.pop_front();
            }
        }
        copied
    }

    fn available(&self) -> usize {
        self.chunks.iter().map(|c| c.remaining().len()).sum()
    }
}

struct Shared {
    queue: Mutex<Queue>,
    reading: AtomicBool,
    write: WriteFn,
}

/// Ordered byte relay with an async wait-for-data read side.
///
/// Cloning yields another handle to the same stream.
pub struct InnerStream {
    shared: Arc<Shared>,
    /// This handle owns the read slot across pending `poll_read` calls
    polling: bool,
}

impl Clone for InnerStream {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            polling: false,
        }
    }
}

impl InnerStream {
    /// Create a stream whose writes go to `write`
    pub fn new(write: WriteFn) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                reading: AtomicBool::new(false),
                write,
            }),
            polling: false,
        }
    }

    /// Append bytes delivered by the network. Never blocks.
    ///
    /// Bytes arriving after [`Self::close`] are discarded.
    pub fn received(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let waiter = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.chunks.push_back(Chunk { data, pos: 0 });
            queue.waiter.take()
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
    }

    /// Read queued bytes into `buf`, waiting until at least one is available.
    ///
    /// Returns immediately when bytes are already queued. Fails with
    /// `Cancelled` when `cancel` fires first (the queue is left as it was),
    /// with `ConcurrentRead` when another read is outstanding, and with
    /// `Closed` once the stream is closed and drained.
    pub async fn read(
        &self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, InnerStreamError> {
        let _guard = ReadGuard::acquire(&self.shared)?;

        tokio::select! {
            biased;
            result = poll_fn(|cx| self.poll_fill(cx, &mut *buf)) => result,
            _ = cancel.cancelled() => Err(InnerStreamError::Cancelled),
        }
    }

    /// Hand `data` to the write callback
    pub fn write(&self, data: Bytes) -> Result<(), SendError> {
        (self.shared.write)(data)
    }

    /// Close the stream and wake any waiting reader.
    ///
    /// Bytes already queued stay readable; after that reads fail with
    /// `Closed`.
    pub fn close(&self) {
        let waiter = {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            queue.waiter.take()
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
    }

    /// Whether [`Self::close`] was called
    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Number of queued, unread bytes
    pub fn available(&self) -> usize {
        self.shared.queue.lock().available()
    }

    fn poll_fill(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, InnerStreamError>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut queue = self.shared.queue.lock();
        let copied = queue.drain_into(buf);
        if copied > 0 {
            return Poll::Ready(Ok(copied));
        }
        if queue.closed {
            return Poll::Ready(Err(InnerStreamError::Closed));
        }
        queue.waiter = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl fmt::Debug for InnerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("InnerStream")
            .field("chunks", &queue.chunks.len())
            .field("available", &queue.available())
            .field("closed", &queue.closed)
            .finish()
    }
}

struct ReadGuard<'a> {
    shared: &'a Shared,
}

impl<'a> ReadGuard<'a> {
    fn acquire(shared: &'a Shared) -> Result<Self, InnerStreamError> {
        shared
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| InnerStreamError::ConcurrentRead)?;
        Ok(Self { shared })
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.shared.release_read();
    }
}

impl Shared {
    fn release_read(&self) {
        self.queue.lock().waiter = None;
        self.reading.store(false, Ordering::Release);
    }
}

impl Drop for InnerStream {
    fn drop(&mut self) {
        if self.polling {
            self.shared.release_read();
        }
    }
}

/// Reads through the same single-reader slot as [`InnerStream::read`]; the
/// slot is held from the first pending poll until the read completes or the
/// handle is dropped.
impl AsyncRead for InnerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.polling {
            if self
                .shared
                .reading
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    InnerStreamError::ConcurrentRead,
                )));
            }
            self.polling = true;
        }

        let result = match self.poll_fill(cx, buf.initialize_unfilled()) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        self.polling = false;
        self.shared.release_read();

        match result {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            // Closed and drained reads as EOF
            Err(_) => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for InnerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.write(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
