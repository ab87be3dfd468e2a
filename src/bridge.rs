//! Decoupled writable/readable channel pair.
//!
//! A bridge gives a process stream an identity before the process exists: the
//! caller can hold the [`BridgeWriter`] of a stdin or the [`BridgeReader`] of a
//! stdout while arguments are still being resolved, and the invocation later
//! connects the opposite halves to the real descriptors.
//!
//! ```text
//!   BridgeWriter ──▶ [one chunk in flight] ──▶ BridgeReader
//!                    ├── second write before drain → WriteInFlight
//!                    ├── chunk fully drained → WriteAck resolves
//!                    ├── close/drop writer → EOF after drain
//!                    └── drop reader → BrokenPipe for writer and pending ack
//! ```
//!
//! The lock is a `std::sync::Mutex` held only for buffer bookkeeping and waker
//! registration, so drop handlers stay synchronous.

use crate::error::BridgeError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

#[derive(Default)]
struct BridgeState {
    chunk: Vec<u8>,
    /// Bytes of `chunk` already handed to the reader.
    pos: usize,
    in_flight: bool,
    /// Number of accepted chunks.
    written: u64,
    /// Number of chunks fully drained by the reader.
    delivered: u64,
    writer_closed: bool,
    reader_closed: bool,
    reader_waker: Option<Waker>,
    write_waker: Option<Waker>,
    ack_waker: Option<Waker>,
}

impl BridgeState {
    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.ack_waker.take() {
            waker.wake();
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.reader_waker.take() {
            waker.wake();
        }
    }

    fn check_writable(&self) -> Result<(), BridgeError> {
        if self.reader_closed {
            Err(BridgeError::BrokenPipe)
        } else if self.writer_closed {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    fn accept(&mut self, data: Vec<u8>) -> u64 {
        self.chunk = data;
        self.pos = 0;
        self.in_flight = true;
        self.written += 1;
        self.wake_reader();
        self.written
    }
}

struct Shared {
    state: Mutex<BridgeState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writable end of a bridge.
pub struct BridgeWriter {
    shared: Arc<Shared>,
    on_use: Option<Arc<Notify>>,
}

/// Readable end of a bridge.
pub struct BridgeReader {
    shared: Arc<Shared>,
    on_use: Option<Arc<Notify>>,
}

fn notify_use(on_use: &Option<Arc<Notify>>) {
    if let Some(signal) = on_use {
        signal.notify_one();
    }
}

/// Create an independent writable/readable pair.
pub fn bridge() -> (BridgeWriter, BridgeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(BridgeState::default()),
    });
    (
        BridgeWriter {
            shared: shared.clone(),
            on_use: None,
        },
        BridgeReader {
            shared,
            on_use: None,
        },
    )
}

impl BridgeWriter {
    /// Notify `signal` whenever data is written through this end.
    pub(crate) fn notify_on_use(mut self, signal: Arc<Notify>) -> Self {
        self.on_use = Some(signal);
        self
    }

    /// Hand `chunk` to the readable side.
    ///
    /// Only one chunk may be in flight: if the previous chunk has not been fully
    /// drained by the reader this fails with [`BridgeError::WriteInFlight`]
    /// instead of queueing. Await the returned [`WriteAck`] before writing again.
    pub fn write(&self, chunk: impl Into<Vec<u8>>) -> Result<WriteAck, BridgeError> {
        notify_use(&self.on_use);
        let chunk = chunk.into();
        let mut state = self.shared.lock();
        state.check_writable()?;
        if state.in_flight {
            return Err(BridgeError::WriteInFlight);
        }
        let seq = if chunk.is_empty() {
            state.delivered
        } else {
            state.accept(chunk)
        };
        Ok(WriteAck {
            shared: self.shared.clone(),
            seq,
        })
    }

    /// Signal end of input. The reader sees end-of-stream once every
    /// outstanding byte has been drained. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.writer_closed = true;
        state.wake_reader();
    }

    /// Whether a written chunk is still waiting to be drained.
    pub fn is_in_flight(&self) -> bool {
        self.shared.lock().in_flight
    }
}

/// Resolves once the chunk it was issued for has been fully drained.
///
/// Fails with [`BridgeError::BrokenPipe`] if the reader is dropped first, so a
/// pending chunk is never lost silently.
#[must_use = "the acknowledgment must be awaited before the next write"]
pub struct WriteAck {
    shared: Arc<Shared>,
    seq: u64,
}

impl Future for WriteAck {
    type Output = Result<(), BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if state.delivered >= self.seq {
            Poll::Ready(Ok(()))
        } else if state.reader_closed {
            Poll::Ready(Err(BridgeError::BrokenPipe))
        } else {
            state.ack_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl AsyncWrite for BridgeWriter {
    /// Unlike [`BridgeWriter::write`], waits for the in-flight chunk to drain
    /// instead of failing, so copy loops get backpressure for free.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        notify_use(&self.on_use);
        let mut state = self.shared.lock();
        if let Err(err) = state.check_writable() {
            return Poll::Ready(Err(err.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if state.in_flight {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        state.accept(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl BridgeReader {
    /// Notify `signal` whenever this end is read.
    pub(crate) fn notify_on_use(mut self, signal: Arc<Notify>) -> Self {
        self.on_use = Some(signal);
        self
    }
}

impl AsyncRead for BridgeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        notify_use(&self.on_use);
        let mut state = self.shared.lock();

        if state.in_flight {
            let pending = &state.chunk[state.pos..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            state.pos += n;
            if state.pos == state.chunk.len() {
                state.chunk = Vec::new();
                state.pos = 0;
                state.in_flight = false;
                state.delivered += 1;
                state.wake_writer();
            }
            Poll::Ready(Ok(()))
        } else if state.writer_closed {
            Poll::Ready(Ok(()))
        } else {
            state.reader_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.reader_closed = true;
        state.chunk = Vec::new();
        state.wake_writer();
    }
}

impl std::fmt::Debug for BridgeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeWriter").finish()
    }
}

impl std::fmt::Debug for BridgeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeReader").finish()
    }
}
