//! Flow-controlled byte buffers coupling application IO to channel windows.
//!
//! A [`WindowBuffer`] is a bounded FIFO whose capacity is tied to a window
//! counter. The invariant, at every quiescent point:
//!
//! ```text
//! window + buffered + unadvertised_credit = max
//! ```
//!
//! Enqueueing consumes window; dequeueing turns buffered bytes into
//! credit; [`WindowBuffer::window_adjust`] converts credit back into
//! window once free space crosses half the capacity, and is the sole
//! source of `ChannelWindowAdjust` messages.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

pub(crate) struct WindowBuffer {
    max: u32,
    state: Mutex<BufferState>,
    /// Bytes enqueued or EOF signalled.
    readable: Notify,
    /// Bytes dequeued.
    space: Notify,
}

struct BufferState {
    queue: VecDeque<u8>,
    window: u32,
    eof: bool,
}

impl WindowBuffer {
    pub(crate) fn new(max: u32) -> Self {
        Self {
            max,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                window: max,
                eof: false,
            }),
            readable: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn window_size(&self) -> u32 {
        self.lock().window
    }

    /// Whether EOF has been signalled; the buffer may still hold bytes.
    pub(crate) fn is_eof(&self) -> bool {
        self.lock().eof
    }

    /// Writes as much of `data` as the window permits without waiting and
    /// returns the number of bytes taken. The dispatcher treats any
    /// shortfall as a window-underrun protocol error.
    pub(crate) fn enqueue_now(&self, data: &[u8]) -> usize {
        let mut state = self.lock();
        let n = (state.window as usize).min(data.len());
        state.queue.extend(data.iter().take(n));
        state.window -= n as u32;
        drop(state);
        if n > 0 {
            self.readable.notify_waiters();
        }
        n
    }

    /// Waits until at least one byte is buffered, or EOF has been
    /// signalled and the buffer is drained. Returns whether bytes are
    /// available.
    pub(crate) async fn wait_readable(&self) -> bool {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();
            {
                let state = self.lock();
                if !state.queue.is_empty() {
                    return true;
                }
                if state.eof {
                    return false;
                }
            }
            readable.await;
        }
    }

    /// Takes up to `max` bytes, waiting until at least one is available.
    /// An empty chunk means EOF.
    pub(crate) async fn dequeue(&self, max: usize) -> Vec<u8> {
        if max == 0 {
            return Vec::new();
        }
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();
            {
                let mut state = self.lock();
                if !state.queue.is_empty() {
                    let n = state.queue.len().min(max);
                    let chunk: Vec<u8> = state.queue.drain(..n).collect();
                    drop(state);
                    self.space.notify_waiters();
                    return chunk;
                }
                if state.eof {
                    return Vec::new();
                }
            }
            readable.await;
        }
    }

    /// Signals end of stream. Idempotent.
    pub(crate) fn send_eof(&self) {
        let mut state = self.lock();
        state.eof = true;
        drop(state);
        self.readable.notify_waiters();
    }

    fn adjust_locked(&self, state: &mut BufferState) -> Option<u32> {
        let buffered = state.queue.len() as u32;
        let credit = self.max - state.window - buffered;
        let free = self.max - buffered;
        if credit > 0 && free >= self.max / 2 {
            state.window += credit;
            Some(credit)
        } else {
            None
        }
    }

    /// Waits until free space reaches half the capacity and some credit is
    /// pending, then converts the whole credit into window and returns it.
    pub(crate) async fn window_adjust(&self) -> u32 {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(credit) = self.adjust_locked(&mut state) {
                    return credit;
                }
            }
            space.await;
        }
    }

    /// Non-blocking variant, used by outbound drains to recycle capacity
    /// to local writers.
    pub(crate) fn try_window_adjust(&self) -> Option<u32> {
        let mut state = self.lock();
        self.adjust_locked(&mut state)
    }
}

/// `AsyncRead` over the inbound side of a channel buffer. A zero-byte
/// read means the peer sent EOF.
pub struct BufferReader {
    buf: Arc<WindowBuffer>,
}

impl BufferReader {
    pub(crate) fn new(buf: Arc<WindowBuffer>) -> Self {
        Self { buf }
    }
}

impl std::fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader").finish()
    }
}

impl AsyncRead for BufferReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = match self.buf.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };

        if !state.queue.is_empty() {
            let n = state.queue.len().min(out.remaining());
            let chunk: Vec<u8> = state.queue.drain(..n).collect();
            drop(state);
            out.put_slice(&chunk);
            self.buf.space.notify_waiters();
            return Poll::Ready(Ok(()));
        }
        if state.eof {
            return Poll::Ready(Ok(()));
        }
        drop(state);
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// `AsyncWrite` over the outbound side of a channel buffer. Shutting the
/// writer down (or dropping it) signals EOF.
pub struct BufferWriter {
    buf: Arc<WindowBuffer>,
}

impl BufferWriter {
    pub(crate) fn new(buf: Arc<WindowBuffer>) -> Self {
        Self { buf }
    }

    /// Signals end of stream without consuming the writer.
    pub fn finish(&self) {
        self.buf.send_eof();
    }
}

impl std::fmt::Debug for BufferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferWriter").finish()
    }
}

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut state = match self.buf.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };

        if state.eof {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let writable = (state.window as usize).min(data.len());
        if writable == 0 {
            drop(state);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        state.queue.extend(data.iter().take(writable));
        state.window -= writable as u32;
        drop(state);
        self.buf.readable.notify_waiters();
        Poll::Ready(Ok(writable))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.buf.send_eof();
        Poll::Ready(Ok(()))
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        self.buf.send_eof();
    }
}
