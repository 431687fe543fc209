// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The connection dispatcher and the handles it hands out.
//!
//! One reader task, the [`Connection::run`] future, is the sole consumer
//! of inbound messages; one writer task is the sole producer of outbound
//! messages, fed by a single-slot mailbox that every supervisor and handle
//! publishes into. Handlers mutate shared state under the connection lock
//! and perform IO only after releasing it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::channel::{
    select_free_id, Channel, ChannelApp, ChannelState, ClientSessionState, DuplexState,
    OpenRejected, PendingOpen, RemoteWindow, ServerSessionState,
};
use crate::stream::{MessageSink, MessageSource, MessageStream};
use crate::switchboard::{ForwardingOpener, Switchboard};
use crate::window::{BufferReader, BufferWriter, WindowBuffer};
use crate::wire::{
    ChannelOpenKind, ChannelRequestKind, GlobalRequestKind, Message, OpenFailureReason, PtyRequest,
    TcpIpParams,
};
use crate::{msg, Address, ChannelId, Config, Error, Exit, HandlerError};

mod supervisor;
use supervisor::{DuplexWork, SessionWork, SupervisorCtx};

/// What a server session handler is asked to run.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Environment accumulated from `env` requests, in arrival order.
    pub env: Vec<(String, String)>,
    /// The pseudo-terminal requested before the shell/exec, if any.
    pub pty: Option<PtyRequest>,
    /// `Some(command)` for `exec`, `None` for `shell`.
    pub command: Option<Vec<u8>>,
}

/// The three standard streams of a session, as ordinary tokio IO.
/// Dropping the writers (or finishing the handler) ends their streams.
#[derive(Debug)]
pub struct SessionIo {
    pub stdin: BufferReader,
    pub stdout: BufferWriter,
    pub stderr: BufferWriter,
}

/// The duplex stream of a tunnelled TCP channel.
#[derive(Debug)]
pub struct TcpIpIo {
    pub rx: BufferReader,
    pub tx: BufferWriter,
}

/// Server-side session application. The returned code becomes the
/// channel's `exit-status`; an error becomes `exit-signal("ILL", …)`.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn run(&self, request: SessionRequest, io: SessionIo) -> Result<u32, HandlerError>;
}

/// Handler for tunnelled TCP channels (`direct-tcpip` on a server,
/// `forwarded-tcpip` on a client).
#[async_trait]
pub trait TcpIpHandler: Send + Sync + 'static {
    async fn run(&self, params: TcpIpParams, io: TcpIpIo) -> Result<(), HandlerError>;
}

/// Application wiring for one connection. A channel-open kind without a
/// callback is refused with `ChannelOpenAdministrativelyProhibited`.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_session: Option<Arc<dyn SessionHandler>>,
    pub on_direct_tcpip: Option<Arc<dyn TcpIpHandler>>,
    pub on_forwarded_tcpip: Option<Arc<dyn TcpIpHandler>>,
    pub switchboard: Option<Arc<Switchboard>>,
}

pub(crate) struct ConnState {
    pub config: Config,
    pub channels: HashMap<u32, ChannelState>,
    /// Forwardings this connection registered on the switchboard.
    pub forwardings: Vec<Address>,
    /// Pending replies to our own global requests, in request order.
    pub global_replies: VecDeque<oneshot::Sender<bool>>,
    pub closed: bool,
}

pub(crate) struct Shared {
    state: Mutex<ConnState>,
    /// Notified whenever a channel leaves the table.
    idle: Notify,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A connection-protocol endpoint bound to a transport. Run it with
/// [`Connection::run`]; drive it through the [`ConnectionHandle`] returned
/// by [`Connection::new`].
pub struct Connection<S: MessageStream> {
    stream: S,
    shared: Arc<Shared>,
    callbacks: Callbacks,
    identity: Option<String>,
    out_tx: mpsc::Sender<Message>,
    out_rx: mpsc::Receiver<Message>,
}

impl<S: MessageStream> Connection<S> {
    /// Binds a connection to an established transport. `identity` is the
    /// authenticated identity on a server, used for switchboard
    /// registrations.
    pub fn new(
        config: Config,
        callbacks: Callbacks,
        identity: Option<String>,
        stream: S,
    ) -> (Self, ConnectionHandle) {
        let (out_tx, out_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnState {
                config,
                channels: HashMap::new(),
                forwardings: Vec::new(),
                global_replies: VecDeque::new(),
                closed: false,
            }),
            idle: Notify::new(),
        });
        let handle = ConnectionHandle {
            shared: shared.clone(),
            out: out_tx.clone(),
        };
        (
            Connection {
                stream,
                shared,
                callbacks,
                identity,
                out_tx,
                out_rx,
            },
            handle,
        )
    }

    /// The connection event loop. Returns when the peer disconnects, the
    /// transport ends, or a protocol error forces a teardown; in the
    /// latter case a `Disconnect(ProtocolError)` is sent first.
    pub async fn run(self) -> Result<(), Error> {
        let Connection {
            stream,
            shared,
            callbacks,
            identity,
            out_tx,
            out_rx,
        } = self;
        let (mut source, sink) = stream.split();
        let writer = tokio::spawn(write_loop(sink, out_rx));
        let mut dispatcher = Dispatcher {
            shared,
            callbacks,
            identity,
            out: out_tx.clone(),
        };

        let result = loop {
            match source.receive().await {
                Ok(Some(message)) => match dispatcher.dispatch(message).await {
                    Ok(true) => continue,
                    Ok(false) => break Ok(()),
                    Err(err) => break Err(err),
                },
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        match &result {
            Ok(()) => {
                dispatcher.teardown();
                writer.abort();
                let _ = writer.await;
            }
            Err(err) => {
                warn!("connection torn down: {err}");
                let _ = out_tx
                    .send(Message::Disconnect {
                        reason: msg::SSH_DISCONNECT_PROTOCOL_ERROR,
                        description: err.to_string(),
                        language: String::new(),
                    })
                    .await;
                dispatcher.teardown();
                // The writer stops by itself after forwarding the disconnect.
                let _ = writer.await;
            }
        }
        result
    }
}

/// The writer task: sole producer into the sink. Stops after forwarding a
/// `Disconnect`.
async fn write_loop<K: MessageSink>(mut sink: K, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        trace!("-> {message:?}");
        let last = matches!(message, Message::Disconnect { .. });
        if sink.send(message).await.is_err() {
            break;
        }
        if last {
            break;
        }
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    callbacks: Callbacks,
    identity: Option<String>,
    out: mpsc::Sender<Message>,
}

impl Dispatcher {
    async fn queue(&self, message: Message) -> Result<(), Error> {
        self.out.send(message).await.map_err(|_| Error::SendError)
    }

    /// Handles one inbound message. `Ok(false)` ends the loop cleanly;
    /// errors are fatal to the connection.
    async fn dispatch(&mut self, message: Message) -> Result<bool, Error> {
        trace!("<- {message:?}");
        match message {
            Message::Disconnect { reason, .. } => {
                debug!("peer disconnected (reason {reason})");
                Ok(false)
            }
            Message::ChannelOpen {
                sender,
                initial_window,
                max_packet,
                kind,
            } => {
                self.channel_open(sender, initial_window, max_packet, kind)
                    .await?;
                Ok(true)
            }
            Message::ChannelOpenConfirmation {
                recipient,
                sender,
                initial_window,
                max_packet,
            } => {
                self.channel_open_confirmation(recipient, sender, initial_window, max_packet)?;
                Ok(true)
            }
            Message::ChannelOpenFailure {
                recipient,
                reason,
                description,
                ..
            } => {
                self.channel_open_failure(recipient, reason, description)?;
                Ok(true)
            }
            Message::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                let window = {
                    let state = self.shared.lock();
                    match state.channels.get(&recipient.0) {
                        Some(ChannelState::Running(channel)) => {
                            Some(channel.remote_window.clone())
                        }
                        Some(ChannelState::Closing) => None,
                        Some(ChannelState::Opening(_)) | None => return Err(Error::WrongChannel),
                    }
                };
                if let Some(window) = window {
                    window.grow(bytes_to_add)?;
                }
                Ok(true)
            }
            Message::ChannelData { recipient, data } => {
                self.channel_data(recipient, None, data)?;
                Ok(true)
            }
            Message::ChannelExtendedData {
                recipient,
                code,
                data,
            } => {
                self.channel_data(recipient, Some(code), data)?;
                Ok(true)
            }
            Message::ChannelEof { recipient } => {
                let mut state = self.shared.lock();
                match state.channels.get_mut(&recipient.0) {
                    Some(ChannelState::Running(channel)) => channel.app.recv_eof()?,
                    Some(ChannelState::Closing) => {}
                    Some(ChannelState::Opening(_)) | None => return Err(Error::WrongChannel),
                }
                Ok(true)
            }
            Message::ChannelClose { recipient } => {
                self.channel_close(recipient).await?;
                Ok(true)
            }
            Message::ChannelRequest {
                recipient,
                want_reply,
                kind,
            } => {
                self.channel_request(recipient, want_reply, kind).await?;
                Ok(true)
            }
            Message::ChannelSuccess { recipient } => {
                self.request_reply(recipient, true)?;
                Ok(true)
            }
            Message::ChannelFailure { recipient } => {
                self.request_reply(recipient, false)?;
                Ok(true)
            }
            Message::GlobalRequest { want_reply, kind } => {
                self.global_request(want_reply, kind).await?;
                Ok(true)
            }
            Message::RequestSuccess => {
                self.global_reply(true)?;
                Ok(true)
            }
            Message::RequestFailure => {
                self.global_reply(false)?;
                Ok(true)
            }
        }
    }

    async fn channel_open(
        &mut self,
        sender: ChannelId,
        initial_window: u32,
        max_packet: u32,
        kind: ChannelOpenKind,
    ) -> Result<(), Error> {
        let mut barrier = None;
        let reply = {
            let mut state = self.shared.lock();
            let local = select_free_id(&state.channels, state.config.channel_max_count);
            match (local, kind) {
                (None, _) => {
                    debug!("rejecting channel open from {sender}: no free slot");
                    open_failure(
                        sender,
                        OpenFailureReason::ResourceShortage,
                        "no free channel slot",
                    )
                }
                (Some(id), ChannelOpenKind::Session) => {
                    if self.callbacks.on_session.is_some() {
                        let queue = state.config.queue_size();
                        let packet = state.config.packet_size();
                        let app = ChannelApp::ServerSession(ServerSessionState {
                            env: Vec::new(),
                            pty: None,
                            stdin: Arc::new(WindowBuffer::new(queue)),
                            stdout: Arc::new(WindowBuffer::new(queue)),
                            stderr: Arc::new(WindowBuffer::new(queue)),
                            started: false,
                        });
                        state.channels.insert(
                            id,
                            ChannelState::Running(Channel {
                                remote_id: sender.0,
                                remote_window: Arc::new(RemoteWindow::new(initial_window)),
                                remote_max_packet: max_packet,
                                supervisor: None,
                                app,
                            }),
                        );
                        debug!("session channel {id} opened by peer {sender}");
                        Message::ChannelOpenConfirmation {
                            recipient: sender,
                            sender: ChannelId(id),
                            initial_window: queue,
                            max_packet: packet,
                        }
                    } else {
                        open_failure(
                            sender,
                            OpenFailureReason::AdministrativelyProhibited,
                            "session channels are not enabled",
                        )
                    }
                }
                (Some(id), ChannelOpenKind::DirectTcpIp(params)) => {
                    match self.callbacks.on_direct_tcpip.clone() {
                        Some(handler) => self.accept_duplex(
                            &mut state,
                            id,
                            sender,
                            initial_window,
                            max_packet,
                            params,
                            handler,
                            false,
                            &mut barrier,
                        ),
                        None => open_failure(
                            sender,
                            OpenFailureReason::AdministrativelyProhibited,
                            "direct-tcpip channels are not enabled",
                        ),
                    }
                }
                (Some(id), ChannelOpenKind::ForwardedTcpIp(params)) => {
                    match self.callbacks.on_forwarded_tcpip.clone() {
                        Some(handler) => self.accept_duplex(
                            &mut state,
                            id,
                            sender,
                            initial_window,
                            max_packet,
                            params,
                            handler,
                            true,
                            &mut barrier,
                        ),
                        None => open_failure(
                            sender,
                            OpenFailureReason::AdministrativelyProhibited,
                            "forwarded-tcpip channels are not enabled",
                        ),
                    }
                }
                (Some(_), ChannelOpenKind::Other { typ, .. }) => {
                    debug!("rejecting channel open of unknown type {typ:?}");
                    open_failure(
                        sender,
                        OpenFailureReason::UnknownChannelType,
                        "Unknown channel type",
                    )
                }
            }
        };
        self.queue(reply).await?;
        if let Some(barrier) = barrier {
            let _ = barrier.send(());
        }
        Ok(())
    }

    /// Builds a running tunnel channel with its supervisor and worker.
    /// The supervisor handle is inserted before the barrier is released.
    #[allow(clippy::too_many_arguments)]
    fn accept_duplex(
        &self,
        state: &mut ConnState,
        id: u32,
        sender: ChannelId,
        initial_window: u32,
        max_packet: u32,
        params: TcpIpParams,
        handler: Arc<dyn TcpIpHandler>,
        forwarded: bool,
        barrier: &mut Option<oneshot::Sender<()>>,
    ) -> Message {
        let queue = state.config.queue_size();
        let packet = state.config.packet_size();
        let rx = Arc::new(WindowBuffer::new(queue));
        let tx = Arc::new(WindowBuffer::new(queue));
        let remote_window = Arc::new(RemoteWindow::new(initial_window));
        let (barrier_tx, barrier_rx) = oneshot::channel();
        let work = DuplexWork {
            handler,
            params,
            io: TcpIpIo {
                rx: BufferReader::new(rx.clone()),
                tx: BufferWriter::new(tx.clone()),
            },
        };
        let ctx = SupervisorCtx {
            local_id: id,
            remote_id: sender.0,
            remote_window: remote_window.clone(),
            remote_max_packet: max_packet,
            out: self.out.clone(),
            shared: self.shared.clone(),
        };
        let handle = tokio::spawn(supervisor::server_duplex(
            ctx,
            tx.clone(),
            rx.clone(),
            work,
            barrier_rx,
        ));
        let duplex = DuplexState { rx, tx };
        let app = if forwarded {
            ChannelApp::ForwardedTcpIp(duplex)
        } else {
            ChannelApp::DirectTcpIp(duplex)
        };
        state.channels.insert(
            id,
            ChannelState::Running(Channel {
                remote_id: sender.0,
                remote_window,
                remote_max_packet: max_packet,
                supervisor: Some(handle),
                app,
            }),
        );
        *barrier = Some(barrier_tx);
        debug!("tunnel channel {id} opened by peer {sender}");
        Message::ChannelOpenConfirmation {
            recipient: sender,
            sender: ChannelId(id),
            initial_window: queue,
            max_packet: packet,
        }
    }

    fn channel_open_confirmation(
        &mut self,
        recipient: ChannelId,
        sender: ChannelId,
        initial_window: u32,
        max_packet: u32,
    ) -> Result<(), Error> {
        let mut state = self.shared.lock();
        let pending = match state.channels.remove(&recipient.0) {
            Some(ChannelState::Opening(pending)) => pending,
            // We have not requested this channel.
            _ => return Err(Error::Inconsistent),
        };
        let remote_window = Arc::new(RemoteWindow::new(initial_window));
        let (barrier_tx, barrier_rx) = oneshot::channel();
        let ctx = SupervisorCtx {
            local_id: recipient.0,
            remote_id: sender.0,
            remote_window: remote_window.clone(),
            remote_max_packet: max_packet,
            out: self.out.clone(),
            shared: self.shared.clone(),
        };
        let handle = match &pending.app {
            ChannelApp::ClientSession(session) => tokio::spawn(supervisor::client_session(
                ctx,
                session.stdin.clone(),
                session.stdout.clone(),
                session.stderr.clone(),
                pending.close_rx.clone(),
                barrier_rx,
            )),
            ChannelApp::DirectTcpIp(duplex) | ChannelApp::ForwardedTcpIp(duplex) => {
                tokio::spawn(supervisor::client_duplex(
                    ctx,
                    duplex.tx.clone(),
                    duplex.rx.clone(),
                    pending.close_rx.clone(),
                    barrier_rx,
                ))
            }
            ChannelApp::ServerSession(_) => return Err(Error::Inconsistent),
        };
        state.channels.insert(
            recipient.0,
            ChannelState::Running(Channel {
                remote_id: sender.0,
                remote_window,
                remote_max_packet: max_packet,
                supervisor: Some(handle),
                app: pending.app,
            }),
        );
        drop(state);
        debug!("channel {recipient} confirmed by peer as {sender}");
        let _ = pending.reply.send(Ok(()));
        let _ = barrier_tx.send(());
        Ok(())
    }

    fn channel_open_failure(
        &mut self,
        recipient: ChannelId,
        reason: OpenFailureReason,
        description: String,
    ) -> Result<(), Error> {
        let pending = {
            let mut state = self.shared.lock();
            match state.channels.remove(&recipient.0) {
                Some(ChannelState::Opening(pending)) => pending,
                _ => return Err(Error::Inconsistent),
            }
        };
        debug!("channel {recipient} refused by peer: {description}");
        let _ = pending.reply.send(Err(OpenRejected {
            reason,
            description,
        }));
        self.shared.idle.notify_waiters();
        Ok(())
    }

    /// Inbound `ChannelData` / `ChannelExtendedData`.
    fn channel_data(
        &mut self,
        recipient: ChannelId,
        code: Option<u32>,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let max = {
            let state = self.shared.lock();
            state.config.packet_size()
        };
        if data.len() > max as usize {
            return Err(Error::PacketSize(data.len()));
        }
        let buffer = {
            let state = self.shared.lock();
            match state.channels.get(&recipient.0) {
                Some(ChannelState::Running(channel)) => {
                    if channel.app.in_eof() {
                        // Data after the peer's own EOF.
                        return Err(Error::Inconsistent);
                    }
                    match code {
                        None => channel.app.inbound().clone(),
                        Some(msg::SSH_EXTENDED_DATA_STDERR) => match &channel.app {
                            ChannelApp::ClientSession(session) => session.stderr.clone(),
                            _ => return Err(Error::Inconsistent),
                        },
                        Some(_) => return Err(Error::Inconsistent),
                    }
                }
                Some(ChannelState::Closing) => return Ok(()),
                Some(ChannelState::Opening(_)) | None => return Err(Error::WrongChannel),
            }
        };
        let written = buffer.enqueue_now(&data);
        if written < data.len() {
            return Err(Error::WindowUnderrun);
        }
        Ok(())
    }

    async fn channel_close(&mut self, recipient: ChannelId) -> Result<(), Error> {
        let reply = {
            let mut state = self.shared.lock();
            match state.channels.remove(&recipient.0) {
                Some(ChannelState::Running(channel)) => {
                    channel.abort_supervisor();
                    channel.app.quench();
                    debug!("channel {recipient} closed by peer");
                    Some(Message::ChannelClose {
                        recipient: ChannelId(channel.remote_id),
                    })
                }
                Some(ChannelState::Closing) => {
                    debug!("channel {recipient} close acknowledged");
                    None
                }
                Some(ChannelState::Opening(_)) => return Err(Error::Inconsistent),
                None => {
                    debug!("close for unknown channel {recipient} ignored");
                    None
                }
            }
        };
        self.shared.idle.notify_waiters();
        if let Some(reply) = reply {
            self.queue(reply).await?;
        }
        Ok(())
    }

    async fn channel_request(
        &mut self,
        recipient: ChannelId,
        want_reply: bool,
        kind: ChannelRequestKind,
    ) -> Result<(), Error> {
        let mut barrier = None;
        let reply = {
            let mut state = self.shared.lock();
            let on_session = self.callbacks.on_session.clone();
            let out = self.out.clone();
            let shared = self.shared.clone();
            match state.channels.get_mut(&recipient.0) {
                Some(ChannelState::Running(channel)) => {
                    let remote = ChannelId(channel.remote_id);
                    let verdict = match (&mut channel.app, kind) {
                        (
                            ChannelApp::ServerSession(session),
                            ChannelRequestKind::Env { name, value },
                        ) => {
                            session.env.push((name, value));
                            true
                        }
                        (ChannelApp::ServerSession(session), ChannelRequestKind::Pty(pty)) => {
                            session.pty = Some(pty);
                            true
                        }
                        (ChannelApp::ServerSession(session), ChannelRequestKind::Shell) => {
                            start_session(
                                session, None, on_session, recipient, channel.remote_id,
                                channel.remote_window.clone(), channel.remote_max_packet,
                                out, shared, &mut channel.supervisor, &mut barrier,
                            )
                        }
                        (
                            ChannelApp::ServerSession(session),
                            ChannelRequestKind::Exec { command },
                        ) => {
                            start_session(
                                session, Some(command), on_session, recipient, channel.remote_id,
                                channel.remote_window.clone(), channel.remote_max_packet,
                                out, shared, &mut channel.supervisor, &mut barrier,
                            )
                        }
                        (
                            ChannelApp::ClientSession(session),
                            ChannelRequestKind::ExitStatus { code },
                        ) => {
                            if let Some(tx) = session.exit.take() {
                                let _ = tx.send(Exit::Status(code));
                            }
                            true
                        }
                        (
                            ChannelApp::ClientSession(session),
                            ChannelRequestKind::ExitSignal {
                                signal,
                                core_dumped,
                                message,
                                lang,
                            },
                        ) => {
                            if let Some(tx) = session.exit.take() {
                                let _ = tx.send(Exit::Signal {
                                    signal,
                                    core_dumped,
                                    message,
                                    lang,
                                });
                            }
                            true
                        }
                        (_, other) => {
                            debug!("rejecting channel request {:?} on {recipient}", request_name(&other));
                            false
                        }
                    };
                    if want_reply {
                        Some(if verdict {
                            Message::ChannelSuccess { recipient: remote }
                        } else {
                            Message::ChannelFailure { recipient: remote }
                        })
                    } else {
                        None
                    }
                }
                Some(ChannelState::Closing) => None,
                Some(ChannelState::Opening(_)) | None => return Err(Error::WrongChannel),
            }
        };
        if let Some(reply) = reply {
            self.queue(reply).await?;
        }
        if let Some(barrier) = barrier {
            let _ = barrier.send(());
        }
        Ok(())
    }

    /// Routes `ChannelSuccess`/`ChannelFailure` to the oldest pending
    /// want-reply request of that channel.
    fn request_reply(&mut self, recipient: ChannelId, success: bool) -> Result<(), Error> {
        let mut state = self.shared.lock();
        match state.channels.get_mut(&recipient.0) {
            Some(ChannelState::Running(channel)) => match &mut channel.app {
                ChannelApp::ClientSession(session) => {
                    let tx = session.replies.pop_front().ok_or(Error::Inconsistent)?;
                    let _ = tx.send(success);
                    Ok(())
                }
                _ => Err(Error::Inconsistent),
            },
            Some(ChannelState::Closing) => Ok(()),
            Some(ChannelState::Opening(_)) | None => Err(Error::WrongChannel),
        }
    }

    async fn global_request(
        &mut self,
        want_reply: bool,
        kind: GlobalRequestKind,
    ) -> Result<(), Error> {
        let granted = match kind {
            GlobalRequestKind::TcpIpForward { host, port } => self.tcpip_forward(host, port),
            GlobalRequestKind::CancelTcpIpForward { host, port } => {
                self.cancel_tcpip_forward(host, port)
            }
            GlobalRequestKind::Other { name, .. } => {
                debug!("rejecting global request {name:?}");
                false
            }
        };
        if want_reply {
            let reply = if granted {
                Message::RequestSuccess
            } else {
                Message::RequestFailure
            };
            self.queue(reply).await?;
        }
        Ok(())
    }

    fn tcpip_forward(&mut self, host: String, port: u32) -> bool {
        let (Some(switchboard), Some(identity)) = (
            self.callbacks.switchboard.as_ref(),
            self.identity.as_deref(),
        ) else {
            return false;
        };
        let Ok(port) = u16::try_from(port) else {
            return false;
        };
        let address = Address::new(host, port);
        let opener = ForwardingOpener::new(Arc::downgrade(&self.shared), self.out.clone());
        if switchboard.request_forwarding(identity, &address, opener) {
            debug!("forwarding registered for {address}");
            self.shared.lock().forwardings.push(address);
            true
        } else {
            false
        }
    }

    fn cancel_tcpip_forward(&mut self, host: String, port: u32) -> bool {
        let (Some(switchboard), Some(identity)) = (
            self.callbacks.switchboard.as_ref(),
            self.identity.as_deref(),
        ) else {
            return false;
        };
        let Ok(port) = u16::try_from(port) else {
            return false;
        };
        let address = Address::new(host, port);
        let cancelled = switchboard.cancel_forwarding(identity, &address);
        self.shared.lock().forwardings.retain(|a| *a != address);
        cancelled
    }

    /// Routes `RequestSuccess`/`RequestFailure` to the oldest pending
    /// global request.
    fn global_reply(&mut self, success: bool) -> Result<(), Error> {
        let tx = {
            let mut state = self.shared.lock();
            state.global_replies.pop_front()
        };
        let tx = tx.ok_or(Error::Inconsistent)?;
        let _ = tx.send(success);
        Ok(())
    }

    /// Cancels every supervisor (and with them the workers), fails
    /// pending opens and replies, and releases this connection's
    /// switchboard registrations.
    fn teardown(&mut self) {
        let (channels, forwardings) = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.global_replies.clear();
            (
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.forwardings),
            )
        };
        for (_, entry) in channels {
            match entry {
                ChannelState::Running(channel) => {
                    channel.abort_supervisor();
                    channel.app.quench();
                }
                // Dropping the pending reply fails the opener.
                ChannelState::Opening(_) | ChannelState::Closing => {}
            }
        }
        if let (Some(switchboard), Some(identity)) = (
            self.callbacks.switchboard.as_ref(),
            self.identity.as_deref(),
        ) {
            for address in forwardings {
                switchboard.cancel_forwarding(identity, &address);
            }
        }
        self.shared.idle.notify_waiters();
    }
}

/// Starts the session worker for a shell/exec request. Returns whether
/// the request was granted.
#[allow(clippy::too_many_arguments)]
fn start_session(
    session: &mut ServerSessionState,
    command: Option<Vec<u8>>,
    handler: Option<Arc<dyn SessionHandler>>,
    local: ChannelId,
    remote_id: u32,
    remote_window: Arc<RemoteWindow>,
    remote_max_packet: u32,
    out: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    supervisor_slot: &mut Option<tokio::task::JoinHandle<()>>,
    barrier: &mut Option<oneshot::Sender<()>>,
) -> bool {
    let Some(handler) = handler else {
        return false;
    };
    if session.started {
        return false;
    }
    session.started = true;
    let request = SessionRequest {
        env: session.env.clone(),
        pty: session.pty.clone(),
        command,
    };
    let io = SessionIo {
        stdin: BufferReader::new(session.stdin.clone()),
        stdout: BufferWriter::new(session.stdout.clone()),
        stderr: BufferWriter::new(session.stderr.clone()),
    };
    let (barrier_tx, barrier_rx) = oneshot::channel();
    let ctx = SupervisorCtx {
        local_id: local.0,
        remote_id,
        remote_window,
        remote_max_packet,
        out,
        shared,
    };
    let handle = tokio::spawn(supervisor::server_session(
        ctx,
        session.stdin.clone(),
        session.stdout.clone(),
        session.stderr.clone(),
        SessionWork {
            handler,
            request,
            io,
        },
        barrier_rx,
    ));
    *supervisor_slot = Some(handle);
    *barrier = Some(barrier_tx);
    debug!("session started on channel {local}");
    true
}

fn open_failure(sender: ChannelId, reason: OpenFailureReason, description: &str) -> Message {
    Message::ChannelOpenFailure {
        recipient: sender,
        reason,
        description: description.into(),
        language: "en".into(),
    }
}

fn request_name(kind: &ChannelRequestKind) -> &str {
    match kind {
        ChannelRequestKind::Env { .. } => "env",
        ChannelRequestKind::Pty(_) => "pty-req",
        ChannelRequestKind::Shell => "shell",
        ChannelRequestKind::Exec { .. } => "exec",
        ChannelRequestKind::ExitStatus { .. } => "exit-status",
        ChannelRequestKind::ExitSignal { .. } => "exit-signal",
        ChannelRequestKind::Other { name, .. } => name.as_str(),
    }
}

/// A cloneable handle for driving a connection from application code.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    out: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Opens a session channel and waits for the peer's verdict.
    pub async fn open_session(&self) -> Result<Session, Error> {
        let queue = {
            let state = self.shared.lock();
            if state.closed {
                return Err(Error::Disconnect);
            }
            state.config.queue_size()
        };
        let stdin = Arc::new(WindowBuffer::new(queue));
        let stdout = Arc::new(WindowBuffer::new(queue));
        let stderr = Arc::new(WindowBuffer::new(queue));
        let (exit_tx, exit_rx) = oneshot::channel();
        let (close_tx, close_rx) = watch::channel(false);
        let app = ChannelApp::ClientSession(ClientSessionState {
            stdin: stdin.clone(),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            exit: Some(exit_tx),
            replies: VecDeque::new(),
        });
        let local = self
            .begin_open(app, close_rx, ChannelOpenKind::Session)
            .await?;
        Ok(Session {
            local_id: local,
            stdin: BufferWriter::new(stdin.clone()),
            stdout: BufferReader::new(stdout),
            stderr: BufferReader::new(stderr),
            stdin_buf: stdin,
            exit: exit_rx,
            close: close_tx,
            out: self.out.clone(),
            shared: self.shared.clone(),
        })
    }

    /// Opens a `direct-tcpip` tunnel through the peer.
    pub async fn open_direct_tcpip(&self, params: TcpIpParams) -> Result<TcpIpChannel, Error> {
        open_tcpip(&self.shared, &self.out, params, false).await
    }

    /// Asks the peer to listen on `host:port` and forward connections
    /// back to us. Returns whether the peer granted the request.
    pub async fn tcpip_forward(
        &self,
        host: impl Into<String> + Send,
        port: u16,
    ) -> Result<bool, Error> {
        self.global_request(GlobalRequestKind::TcpIpForward {
            host: host.into(),
            port: u32::from(port),
        })
        .await
    }

    /// Cancels a previous `tcpip_forward`.
    pub async fn cancel_tcpip_forward(
        &self,
        host: impl Into<String> + Send,
        port: u16,
    ) -> Result<bool, Error> {
        self.global_request(GlobalRequestKind::CancelTcpIpForward {
            host: host.into(),
            port: u32::from(port),
        })
        .await
    }

    async fn global_request(&self, kind: GlobalRequestKind) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::Disconnect);
            }
            state.global_replies.push_back(tx);
        }
        self.out
            .send(Message::GlobalRequest {
                want_reply: true,
                kind,
            })
            .await
            .map_err(|_| Error::SendError)?;
        rx.await.map_err(|_| Error::Disconnect)
    }

    /// Graceful shutdown: waits until every channel has run its close
    /// handshake, then tells the peer to disconnect.
    pub async fn close(&self) -> Result<(), Error> {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            {
                let state = self.shared.lock();
                if state.closed {
                    // The connection is already gone.
                    return Ok(());
                }
                if state.channels.is_empty() {
                    break;
                }
            }
            idle.await;
        }
        self.out
            .send(Message::Disconnect {
                reason: msg::SSH_DISCONNECT_BY_APPLICATION,
                description: "disconnected by user".into(),
                language: String::new(),
            })
            .await
            .map_err(|_| Error::SendError)
    }

    /// Inserts an `Opening` entry, sends the `ChannelOpen`, and waits for
    /// the dispatcher to resolve it.
    async fn begin_open(
        &self,
        app: ChannelApp,
        close_rx: watch::Receiver<bool>,
        kind: ChannelOpenKind,
    ) -> Result<u32, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (local, queue, packet) = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::Disconnect);
            }
            let id = select_free_id(&state.channels, state.config.channel_max_count)
                .ok_or(Error::ChannelLimitReached)?;
            state.channels.insert(
                id,
                ChannelState::Opening(PendingOpen {
                    app,
                    close_rx,
                    reply: reply_tx,
                }),
            );
            (id, state.config.queue_size(), state.config.packet_size())
        };
        self.out
            .send(Message::ChannelOpen {
                sender: ChannelId(local),
                initial_window: queue,
                max_packet: packet,
                kind,
            })
            .await
            .map_err(|_| Error::SendError)?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(local),
            Ok(Err(rejected)) => Err(Error::ChannelOpenFailure(
                rejected.reason,
                rejected.description,
            )),
            Err(_) => Err(Error::Disconnect),
        }
    }
}

pub(crate) async fn open_tcpip(
    shared: &Arc<Shared>,
    out: &mpsc::Sender<Message>,
    params: TcpIpParams,
    forwarded: bool,
) -> Result<TcpIpChannel, Error> {
    let queue = {
        let state = shared.lock();
        if state.closed {
            return Err(Error::Disconnect);
        }
        state.config.queue_size()
    };
    let rx = Arc::new(WindowBuffer::new(queue));
    let tx = Arc::new(WindowBuffer::new(queue));
    let (close_tx, close_rx) = watch::channel(false);
    let duplex = DuplexState {
        rx: rx.clone(),
        tx: tx.clone(),
    };
    let app = if forwarded {
        ChannelApp::ForwardedTcpIp(duplex)
    } else {
        ChannelApp::DirectTcpIp(duplex)
    };
    let kind = if forwarded {
        ChannelOpenKind::ForwardedTcpIp(params)
    } else {
        ChannelOpenKind::DirectTcpIp(params)
    };
    let handle = ConnectionHandle {
        shared: shared.clone(),
        out: out.clone(),
    };
    let local = handle.begin_open(app, close_rx, kind).await?;
    Ok(TcpIpChannel {
        local_id: local,
        rx: BufferReader::new(rx),
        tx: BufferWriter::new(tx.clone()),
        tx_buf: tx,
        close: close_tx,
    })
}

/// A session channel driven by the local side: write `stdin`, read
/// `stdout`/`stderr`, then [`Session::exit_status`].
pub struct Session {
    local_id: u32,
    pub stdin: BufferWriter,
    pub stdout: BufferReader,
    pub stderr: BufferReader,
    stdin_buf: Arc<WindowBuffer>,
    exit: oneshot::Receiver<Exit>,
    close: watch::Sender<bool>,
    out: mpsc::Sender<Message>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> ChannelId {
        ChannelId(self.local_id)
    }

    /// Asks the peer to execute `command`. Returns the peer's verdict.
    pub async fn exec(&self, command: impl Into<Vec<u8>> + Send) -> Result<bool, Error> {
        self.request(ChannelRequestKind::Exec {
            command: command.into(),
        })
        .await
    }

    /// Asks the peer for a login shell.
    pub async fn shell(&self) -> Result<bool, Error> {
        self.request(ChannelRequestKind::Shell).await
    }

    /// Sets a remote environment variable (no reply requested).
    pub async fn setenv(
        &self,
        name: impl Into<String> + Send,
        value: impl Into<String> + Send,
    ) -> Result<(), Error> {
        let remote = self.remote_id()?;
        self.out
            .send(Message::ChannelRequest {
                recipient: remote,
                want_reply: false,
                kind: ChannelRequestKind::Env {
                    name: name.into(),
                    value: value.into(),
                },
            })
            .await
            .map_err(|_| Error::SendError)
    }

    /// Waits for the peer's exit notification.
    pub async fn exit_status(&mut self) -> Result<Exit, Error> {
        (&mut self.exit).await.map_err(|_| Error::Disconnect)
    }

    /// Half-closes stdin and asks the supervisor to close the channel
    /// after the remaining output has drained.
    pub fn close(&self) {
        self.stdin_buf.send_eof();
        let _ = self.close.send(true);
    }

    async fn request(&self, kind: ChannelRequestKind) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        let remote = {
            let mut state = self.shared.lock();
            match state.channels.get_mut(&self.local_id) {
                Some(ChannelState::Running(channel)) => match &mut channel.app {
                    ChannelApp::ClientSession(session) => {
                        session.replies.push_back(tx);
                        ChannelId(channel.remote_id)
                    }
                    _ => return Err(Error::WrongChannel),
                },
                _ => return Err(Error::WrongChannel),
            }
        };
        self.out
            .send(Message::ChannelRequest {
                recipient: remote,
                want_reply: true,
                kind,
            })
            .await
            .map_err(|_| Error::SendError)?;
        rx.await.map_err(|_| Error::Disconnect)
    }

    fn remote_id(&self) -> Result<ChannelId, Error> {
        let state = self.shared.lock();
        match state.channels.get(&self.local_id) {
            Some(ChannelState::Running(channel)) => Ok(ChannelId(channel.remote_id)),
            _ => Err(Error::WrongChannel),
        }
    }
}

/// A tunnelled TCP stream driven by the local side.
pub struct TcpIpChannel {
    local_id: u32,
    pub rx: BufferReader,
    pub tx: BufferWriter,
    tx_buf: Arc<WindowBuffer>,
    close: watch::Sender<bool>,
}

impl TcpIpChannel {
    pub fn id(&self) -> ChannelId {
        ChannelId(self.local_id)
    }

    /// Half-closes the outbound stream and closes the channel once it has
    /// drained.
    pub fn close(&self) {
        self.tx_buf.send_eof();
        let _ = self.close.send(true);
    }
}
