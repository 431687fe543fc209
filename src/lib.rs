#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match)]
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

//! SSH2 connection-protocol layer, based on tokio.
//!
//! This crate implements the channel multiplexer that runs on top of an
//! already-established, encrypted and authenticated SSH transport: channel
//! lifecycle with half-close semantics, per-channel sliding-window flow
//! control, session (shell/exec) and TCP/IP forwarding channels, the
//! server-side forwarding switchboard, and the offline file formats the
//! connection layer needs for host verification and identity loading
//! (`known_hosts` and the `openssh-key-v1` private-key container).
//!
//! The transport itself (key exchange, ciphers, MACs, packet framing) is
//! an external collaborator. It is consumed through the
//! [`MessageStream`](stream::MessageStream) seam, which delivers and accepts
//! already-parsed connection-protocol messages.
//!
//! A server wires application logic in through [`Callbacks`]:
//! session handlers get stdin/stdout/stderr as ordinary tokio IO and return
//! an exit code; tunnel handlers get a duplex byte stream. A client drives
//! the connection through a [`ConnectionHandle`](connection::ConnectionHandle):
//! `open_session`, `exec`, `open_direct_tcpip`, `tcpip_forward` and a
//! graceful `close` that drains in-flight channels first.

use std::fmt::{Display, Formatter};

use thiserror::Error;

pub mod msg;
pub mod wire;

mod window;
pub use window::{BufferReader, BufferWriter};

mod channel;

pub mod stream;
pub use stream::{MessageSink, MessageSource, MessageStream};

pub mod connection;
pub use connection::{Callbacks, Connection, ConnectionHandle, Session, TcpIpChannel};

pub mod switchboard;
pub use switchboard::Switchboard;

pub mod keys;

pub use wire::{Message, OpenFailureReason};

#[derive(Debug, Error)]
pub enum Error {
    /// A message could not be decoded or carried fields outside the
    /// protocol grammar.
    #[error("Malformed message")]
    Malformed,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Excessive packet size.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// A window increment would push the remote window past 2^32-1.
    #[error("Channel window overflow")]
    WindowOverflow,

    /// The peer sent more data than the advertised window allows.
    #[error("Channel window underrun")]
    WindowUnderrun,

    /// Message received on an unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// No free channel slot below the configured channel limit.
    #[error("Too many channels")]
    ChannelLimitReached,

    /// The peer refused to open a channel.
    #[error("Failed to open channel ({0:?}): {1}")]
    ChannelOpenFailure(OpenFailureReason, String),

    /// Disconnected.
    #[error("Disconnected")]
    Disconnect,

    /// The event loop is gone.
    #[error("Channel send error")]
    SendError,

    #[error(transparent)]
    Keys(#[from] keys::Error),

    #[error(transparent)]
    SshEncoding(#[from] ssh_encoding::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Error type surfaced by application handlers. Handler failures never
/// poison the connection; they end the channel with an `exit-signal`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl From<u32> for ChannelId {
    fn from(id: u32) -> ChannelId {
        ChannelId(id)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `host:port` pair as it appears in forwarding requests and in the
/// `known_hosts` database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The canonical name used for host-key lookups: `host` when the port
    /// is 22, `[host]:port` otherwise.
    pub fn canonical(&self) -> String {
        if self.port == 22 {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How a session worker ended, as reported to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The handler returned an exit code: sent as `exit-status`.
    Status(u32),
    /// The handler failed or panicked: sent as `exit-signal`.
    Signal {
        signal: String,
        core_dumped: bool,
        message: String,
        lang: String,
    },
}

/// Limits applied to every channel of a connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximal number of concurrently open channels.
    pub channel_max_count: u16,
    /// Capacity of each channel buffer; also the initial window advertised
    /// to the peer. Out-of-range values are clamped to `1..=2^29-1`.
    pub channel_max_queue_size: u32,
    /// Maximal size of a single inbound data frame. Capped at 35000 and at
    /// the queue size.
    pub channel_max_packet_size: u32,
}

/// Largest admissible queue size (2^29 - 1).
const MAX_QUEUE_SIZE: u32 = (1 << 29) - 1;

/// Largest packet size ever advertised, following OpenSSH.
const MAX_PACKET_SIZE: u32 = 35000;

impl Default for Config {
    fn default() -> Config {
        Config {
            channel_max_count: 256,
            channel_max_queue_size: 32768,
            channel_max_packet_size: 32768,
        }
    }
}

impl Config {
    /// The queue size actually applied, clamped to the valid range.
    pub(crate) fn queue_size(&self) -> u32 {
        self.channel_max_queue_size.clamp(1, MAX_QUEUE_SIZE)
    }

    /// The packet size actually applied.
    pub(crate) fn packet_size(&self) -> u32 {
        self.channel_max_packet_size
            .min(MAX_PACKET_SIZE)
            .min(self.queue_size())
            .max(1)
    }
}
