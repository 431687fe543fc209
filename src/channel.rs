//! Channel table entries and the per-channel bookkeeping shared between
//! the dispatcher and the supervisors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

use crate::window::WindowBuffer;
use crate::wire::{OpenFailureReason, PtyRequest};
use crate::{Error, Exit};

/// The window the peer granted us: how many bytes of `ChannelData` we may
/// still send. Grown by inbound `ChannelWindowAdjust`, consumed by the
/// supervisor's outbound drain.
pub(crate) struct RemoteWindow {
    value: Mutex<u32>,
    grew: Notify,
}

impl RemoteWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            value: Mutex::new(initial),
            grew: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until the window is non-zero and returns how much of it may
    /// be spent, capped at `max`. Nothing is consumed yet.
    pub(crate) async fn reserve(&self, max: u32) -> u32 {
        loop {
            let grew = self.grew.notified();
            tokio::pin!(grew);
            grew.as_mut().enable();
            {
                let value = *self.lock();
                if value > 0 {
                    return value.min(max);
                }
            }
            grew.await;
        }
    }

    pub(crate) fn consume(&self, n: u32) {
        let mut value = self.lock();
        *value = value.saturating_sub(n);
    }

    /// Applies a `ChannelWindowAdjust`. Overflowing 2^32-1 is a fatal
    /// protocol error.
    pub(crate) fn grow(&self, add: u32) -> Result<(), Error> {
        {
            let mut value = self.lock();
            *value = value.checked_add(add).ok_or(Error::WindowOverflow)?;
        }
        self.grew.notify_waiters();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> u32 {
        *self.lock()
    }
}

/// Server-side session: env and pty accumulate until a shell or exec
/// request starts the handler.
pub(crate) struct ServerSessionState {
    pub env: Vec<(String, String)>,
    pub pty: Option<PtyRequest>,
    pub stdin: Arc<WindowBuffer>,
    pub stdout: Arc<WindowBuffer>,
    pub stderr: Arc<WindowBuffer>,
    pub started: bool,
}

/// Client-side session: the caller drives stdin/stdout/stderr through the
/// `Session` handle; exit notifications and request replies are routed
/// here by the dispatcher.
pub(crate) struct ClientSessionState {
    pub stdin: Arc<WindowBuffer>,
    pub stdout: Arc<WindowBuffer>,
    pub stderr: Arc<WindowBuffer>,
    pub exit: Option<oneshot::Sender<Exit>>,
    pub replies: VecDeque<oneshot::Sender<bool>>,
}

/// A tunnelled TCP stream, either direction: `rx` is what the peer sends
/// us, `tx` is what we send the peer.
pub(crate) struct DuplexState {
    pub rx: Arc<WindowBuffer>,
    pub tx: Arc<WindowBuffer>,
}

pub(crate) enum ChannelApp {
    ServerSession(ServerSessionState),
    ClientSession(ClientSessionState),
    DirectTcpIp(DuplexState),
    ForwardedTcpIp(DuplexState),
}

impl ChannelApp {
    /// Buffer that inbound `ChannelData` lands in.
    pub(crate) fn inbound(&self) -> &Arc<WindowBuffer> {
        match self {
            ChannelApp::ServerSession(s) => &s.stdin,
            ChannelApp::ClientSession(s) => &s.stdout,
            ChannelApp::DirectTcpIp(s) | ChannelApp::ForwardedTcpIp(s) => &s.rx,
        }
    }

    /// Whether the peer already half-closed this channel.
    pub(crate) fn in_eof(&self) -> bool {
        self.inbound().is_eof()
    }

    /// Ends every stream of this application, unblocking any IO still
    /// hanging on a dead channel.
    pub(crate) fn quench(&self) {
        match self {
            ChannelApp::ServerSession(s) => {
                s.stdin.send_eof();
                s.stdout.send_eof();
                s.stderr.send_eof();
            }
            ChannelApp::ClientSession(s) => {
                s.stdin.send_eof();
                s.stdout.send_eof();
                s.stderr.send_eof();
            }
            ChannelApp::DirectTcpIp(s) | ChannelApp::ForwardedTcpIp(s) => {
                s.rx.send_eof();
                s.tx.send_eof();
            }
        }
    }

    /// Marks the peer's half-close and propagates EOF to the inbound
    /// buffers. A second EOF is a protocol error.
    pub(crate) fn recv_eof(&mut self) -> Result<(), Error> {
        if self.in_eof() {
            return Err(Error::Inconsistent);
        }
        match self {
            ChannelApp::ServerSession(s) => s.stdin.send_eof(),
            ChannelApp::ClientSession(s) => {
                s.stdout.send_eof();
                s.stderr.send_eof();
            }
            ChannelApp::DirectTcpIp(s) | ChannelApp::ForwardedTcpIp(s) => s.rx.send_eof(),
        }
        Ok(())
    }
}

/// A running channel. Both ids are fixed for its whole lifetime; the
/// remote packet size is whatever the peer advertised when the channel
/// was confirmed.
pub(crate) struct Channel {
    pub remote_id: u32,
    pub remote_window: Arc<RemoteWindow>,
    pub remote_max_packet: u32,
    pub supervisor: Option<JoinHandle<()>>,
    pub app: ChannelApp,
}

impl Channel {
    pub(crate) fn abort_supervisor(&self) {
        if let Some(handle) = &self.supervisor {
            handle.abort();
        }
    }
}

/// Why a locally initiated open was refused.
#[derive(Debug)]
pub(crate) struct OpenRejected {
    pub reason: OpenFailureReason,
    pub description: String,
}

/// A locally initiated open waiting for the peer's verdict. The reply is
/// resolved under the connection lock, atomically with the table update.
pub(crate) struct PendingOpen {
    pub app: ChannelApp,
    pub close_rx: watch::Receiver<bool>,
    pub reply: oneshot::Sender<Result<(), OpenRejected>>,
}

pub(crate) enum ChannelState {
    Opening(PendingOpen),
    Running(Channel),
    /// We sent our `ChannelClose` and are waiting for the peer's. The
    /// state is absorbing: anything but the answering close is ignored.
    Closing,
}

/// The least non-negative id below `max_count` that is not in use.
pub(crate) fn select_free_id(
    channels: &HashMap<u32, ChannelState>,
    max_count: u16,
) -> Option<u32> {
    (0..u32::from(max_count)).find(|id| !channels.contains_key(id))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Allow unwraps, expects and panics in the test suite

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn free_id_is_least_absent() {
        let mut rng = StdRng::seed_from_u64(0xc3);
        for _ in 0..200 {
            let mut channels = HashMap::new();
            for _ in 0..rng.gen_range(0..48) {
                channels.insert(rng.gen_range(0..32u32), ChannelState::Closing);
            }
            let picked = select_free_id(&channels, 32);
            let expected = (0..32u32).find(|id| !channels.contains_key(id));
            assert_eq!(picked, expected);
            if let Some(id) = picked {
                assert!(!channels.contains_key(&id));
                for lower in 0..id {
                    assert!(channels.contains_key(&lower));
                }
            }
        }
    }

    #[test]
    fn full_table_has_no_free_id() {
        let mut channels = HashMap::new();
        for id in 0..4u32 {
            channels.insert(id, ChannelState::Closing);
        }
        assert_eq!(select_free_id(&channels, 4), None);
        assert_eq!(select_free_id(&channels, 5), Some(4));
    }

    #[tokio::test]
    async fn remote_window_overflow_is_fatal() {
        let window = RemoteWindow::new(100);
        window.grow(50).unwrap();
        assert!(matches!(
            window.grow(u32::MAX - 100),
            Err(Error::WindowOverflow)
        ));
        assert_eq!(window.current(), 150);
    }

    #[tokio::test]
    async fn remote_window_reserve_caps_at_max_packet() {
        let window = RemoteWindow::new(1000);
        assert_eq!(window.reserve(64).await, 64);
        window.consume(1000);
        window.grow(3).unwrap();
        assert_eq!(window.reserve(64).await, 3);
    }
}
