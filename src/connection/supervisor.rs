//! Per-channel supervisor tasks.
//!
//! A supervisor owns its channel's outbound side: it drains the outbound
//! buffers into `ChannelData`/`ChannelExtendedData`, replenishes the local
//! window with `ChannelWindowAdjust`, and emits the terminal
//! `ChannelEof`/`exit-status`/`ChannelClose` sequence. The four-way wait
//! is priority-ordered: pending output always drains before a finished
//! worker may emit EOF, so a fast-exiting handler cannot truncate its own
//! output.
//!
//! Supervisors start parked on a barrier: the dispatcher first inserts the
//! supervisor's handle into the channel (so a concurrent teardown is
//! guaranteed to cancel it), then releases the barrier; only then is the
//! worker spawned, under an abort-on-drop guard that ties its lifetime to
//! the supervisor's.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::Either as EitherFuture;
use log::{debug, warn};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use super::{SessionIo, SessionRequest, Shared, TcpIpIo};
use crate::channel::{ChannelState, RemoteWindow};
use crate::window::WindowBuffer;
use crate::wire::{ChannelRequestKind, Message, TcpIpParams};
use crate::{msg, ChannelId, HandlerError};

/// Returns `f(val)` if `val` is [Some], or a forever pending [Future] if it is [None].
fn future_or_pending<R, F: Future<Output = R>, T>(
    val: Option<T>,
    f: impl FnOnce(T) -> F,
) -> EitherFuture<std::future::Pending<R>, F> {
    match val {
        None => EitherFuture::Left(std::future::pending()),
        Some(x) => EitherFuture::Right(f(x)),
    }
}

/// A task handle that cancels the task when dropped, so a supervisor
/// going away always takes its worker with it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct SupervisorCtx {
    pub local_id: u32,
    pub remote_id: u32,
    pub remote_window: Arc<RemoteWindow>,
    pub remote_max_packet: u32,
    pub out: tokio::sync::mpsc::Sender<Message>,
    pub shared: Arc<Shared>,
}

impl SupervisorCtx {
    /// Queues one outbound message. `false` means the connection is gone
    /// and the supervisor should just stop.
    async fn send(&self, message: Message) -> bool {
        self.out.send(message).await.is_ok()
    }

    fn recipient(&self) -> ChannelId {
        ChannelId(self.remote_id)
    }

    /// Records that our `ChannelClose` is on the wire, so the answering
    /// inbound close is treated as an acknowledgement and not replied to.
    /// The application streams end here: a closing channel absorbs all
    /// further inbound traffic.
    fn mark_closing(&self) {
        let mut state = self.shared.lock();
        match state.channels.remove(&self.local_id) {
            Some(ChannelState::Running(channel)) => {
                channel.app.quench();
                state.channels.insert(self.local_id, ChannelState::Closing);
            }
            Some(other) => {
                state.channels.insert(self.local_id, other);
            }
            None => {}
        }
    }
}

pub(crate) struct SessionWork {
    pub handler: Arc<dyn super::SessionHandler>,
    pub request: SessionRequest,
    pub io: SessionIo,
}

pub(crate) struct DuplexWork {
    pub handler: Arc<dyn super::TcpIpHandler>,
    pub params: TcpIpParams,
    pub io: TcpIpIo,
}

/// What ends the channel from our side.
enum Ending {
    /// A session worker: its result becomes `exit-status`/`exit-signal`.
    SessionWorker(AbortOnDrop<Result<u32, HandlerError>>),
    /// A tunnel worker: no exit signalling.
    DuplexWorker(AbortOnDrop<Result<(), HandlerError>>),
    /// A locally opened channel: the handle asks for the close.
    Close(watch::Receiver<bool>),
}

pub(crate) async fn server_session(
    ctx: SupervisorCtx,
    stdin: Arc<WindowBuffer>,
    stdout: Arc<WindowBuffer>,
    stderr: Arc<WindowBuffer>,
    work: SessionWork,
    barrier: oneshot::Receiver<()>,
) {
    if barrier.await.is_err() {
        return;
    }
    let SessionWork {
        handler,
        request,
        io,
    } = work;
    let worker = AbortOnDrop(tokio::spawn(
        async move { handler.run(request, io).await },
    ));
    supervise(
        ctx,
        stdout,
        Some(stderr),
        stdin,
        None,
        Ending::SessionWorker(worker),
    )
    .await;
}

pub(crate) async fn server_duplex(
    ctx: SupervisorCtx,
    tx: Arc<WindowBuffer>,
    rx: Arc<WindowBuffer>,
    work: DuplexWork,
    barrier: oneshot::Receiver<()>,
) {
    if barrier.await.is_err() {
        return;
    }
    let DuplexWork {
        handler,
        params,
        io,
    } = work;
    let worker = AbortOnDrop(tokio::spawn(
        async move { handler.run(params, io).await },
    ));
    supervise(ctx, tx, None, rx, None, Ending::DuplexWorker(worker)).await;
}

pub(crate) async fn client_session(
    ctx: SupervisorCtx,
    stdin: Arc<WindowBuffer>,
    stdout: Arc<WindowBuffer>,
    stderr: Arc<WindowBuffer>,
    close_rx: watch::Receiver<bool>,
    barrier: oneshot::Receiver<()>,
) {
    if barrier.await.is_err() {
        return;
    }
    supervise(
        ctx,
        stdin,
        None,
        stdout,
        Some(stderr),
        Ending::Close(close_rx),
    )
    .await;
}

pub(crate) async fn client_duplex(
    ctx: SupervisorCtx,
    tx: Arc<WindowBuffer>,
    rx: Arc<WindowBuffer>,
    close_rx: watch::Receiver<bool>,
    barrier: oneshot::Receiver<()>,
) {
    if barrier.await.is_err() {
        return;
    }
    supervise(ctx, tx, None, rx, None, Ending::Close(close_rx)).await;
}

/// Waits for data on the outbound buffer, reserves remote window, and
/// takes one wire-sized chunk. `None` means the stream ended.
async fn pump(buf: &WindowBuffer, window: &RemoteWindow, max_packet: u32) -> Option<Vec<u8>> {
    if !buf.wait_readable().await {
        return None;
    }
    let budget = window.reserve(max_packet).await;
    let chunk = buf.dequeue(budget as usize).await;
    if chunk.is_empty() {
        return None;
    }
    window.consume(chunk.len() as u32);
    // Freed capacity goes straight back to the local writer.
    let _ = buf.try_window_adjust();
    Some(chunk)
}

async fn supervise(
    ctx: SupervisorCtx,
    data_out: Arc<WindowBuffer>,
    ext_out: Option<Arc<WindowBuffer>>,
    adjust_a: Arc<WindowBuffer>,
    adjust_b: Option<Arc<WindowBuffer>>,
    ending: Ending,
) {
    let recipient = ctx.recipient();
    let max_packet = ctx.remote_max_packet.max(1);

    let (mut session_worker, mut duplex_worker, mut close_rx) = match ending {
        Ending::SessionWorker(w) => (Some(w), None, None),
        Ending::DuplexWorker(w) => (None, Some(w), None),
        Ending::Close(rx) => (None, None, Some(rx)),
    };

    let mut data_done = false;
    let mut ext_done = ext_out.is_none();
    let mut eof_sent = false;

    loop {
        let drained = data_done && ext_done;
        // A handle-driven channel half-closes as soon as its outbound
        // stream ends; worker-driven channels emit EOF in their finale.
        if drained && !eof_sent && close_rx.is_some() {
            if !ctx.send(Message::ChannelEof { recipient }).await {
                return;
            }
            eof_sent = true;
        }

        tokio::select! {
            biased;

            chunk = pump(&data_out, &ctx.remote_window, max_packet), if !data_done => {
                match chunk {
                    Some(data) => {
                        if !ctx.send(Message::ChannelData { recipient, data }).await {
                            return;
                        }
                    }
                    None => data_done = true,
                }
            }

            chunk = future_or_pending(ext_out.as_deref(), |b| pump(b, &ctx.remote_window, max_packet)), if !ext_done => {
                match chunk {
                    Some(data) => {
                        let message = Message::ChannelExtendedData {
                            recipient,
                            code: msg::SSH_EXTENDED_DATA_STDERR,
                            data,
                        };
                        if !ctx.send(message).await {
                            return;
                        }
                    }
                    None => ext_done = true,
                }
            }

            result = future_or_pending(session_worker.as_mut(), |w| w), if drained && session_worker.is_some() => {
                session_finale(&ctx, result).await;
                return;
            }

            result = future_or_pending(duplex_worker.as_mut(), |w| w), if drained && duplex_worker.is_some() => {
                if let Ok(Err(err)) = &result {
                    debug!("tunnel handler failed: {err}");
                }
                if ctx.send(Message::ChannelEof { recipient }).await {
                    ctx.mark_closing();
                    let _ = ctx.send(Message::ChannelClose { recipient }).await;
                }
                return;
            }

            _ = future_or_pending(close_rx.as_mut(), |rx| async move {
                let _ = rx.wait_for(|closed| *closed).await;
            }), if eof_sent && close_rx.is_some() => {
                ctx.mark_closing();
                let _ = ctx.send(Message::ChannelClose { recipient }).await;
                return;
            }

            bytes = adjust_a.window_adjust() => {
                let message = Message::ChannelWindowAdjust { recipient, bytes_to_add: bytes };
                if !ctx.send(message).await {
                    return;
                }
            }

            bytes = future_or_pending(adjust_b.as_deref(), |b| b.window_adjust()), if adjust_b.is_some() => {
                let message = Message::ChannelWindowAdjust { recipient, bytes_to_add: bytes };
                if !ctx.send(message).await {
                    return;
                }
            }
        }
    }
}

/// Worker exit: `ChannelEof`, then the exit notification, then
/// `ChannelClose`, in this exact order.
async fn session_finale(ctx: &SupervisorCtx, result: Result<Result<u32, HandlerError>, JoinError>) {
    let recipient = ctx.recipient();
    if !ctx.send(Message::ChannelEof { recipient }).await {
        return;
    }
    let kind = match result {
        Ok(Ok(code)) => ChannelRequestKind::ExitStatus { code },
        Ok(Err(err)) => {
            debug!("session handler failed: {err}");
            exit_signal_ill()
        }
        Err(err) => {
            warn!("session worker died: {err}");
            exit_signal_ill()
        }
    };
    let notify = Message::ChannelRequest {
        recipient,
        want_reply: false,
        kind,
    };
    if !ctx.send(notify).await {
        return;
    }
    ctx.mark_closing();
    let _ = ctx.send(Message::ChannelClose { recipient }).await;
}

fn exit_signal_ill() -> ChannelRequestKind {
    ChannelRequestKind::ExitSignal {
        signal: "ILL".into(),
        core_dumped: false,
        message: String::new(),
        lang: String::new(),
    }
}
