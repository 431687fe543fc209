//! Typed connection-protocol messages and their wire codec.
//!
//! Every message starts with a single-byte number (see [`crate::msg`]) and
//! continues with typed fields in a fixed order: big-endian integers,
//! 32-bit length-prefixed byte strings, one-byte booleans. Unknown channel
//! types and unknown channel-request types are preserved as `Other` so the
//! dispatcher can reject them instead of dropping them.

use ssh_encoding::{Decode, Encode, Reader, Writer};

use crate::{msg, ChannelId, Error};

/// Reason codes of a `ChannelOpenFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Other(u32),
}

impl OpenFailureReason {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            Self::AdministrativelyProhibited => msg::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED,
            Self::ConnectFailed => msg::SSH_OPEN_CONNECT_FAILED,
            Self::UnknownChannelType => msg::SSH_OPEN_UNKNOWN_CHANNEL_TYPE,
            Self::ResourceShortage => msg::SSH_OPEN_RESOURCE_SHORTAGE,
            Self::Other(code) => code,
        }
    }

    pub(crate) fn from_u32(code: u32) -> Self {
        match code {
            msg::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED => Self::AdministrativelyProhibited,
            msg::SSH_OPEN_CONNECT_FAILED => Self::ConnectFailed,
            msg::SSH_OPEN_UNKNOWN_CHANNEL_TYPE => Self::UnknownChannelType,
            msg::SSH_OPEN_RESOURCE_SHORTAGE => Self::ResourceShortage,
            other => Self::Other(other),
        }
    }
}

/// Endpoints of a tunnelled TCP stream, as carried by `direct-tcpip` and
/// `forwarded-tcpip` channel opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpIpParams {
    pub host: String,
    pub port: u32,
    pub originator_host: String,
    pub originator_port: u32,
}

impl TcpIpParams {
    fn decode(r: &mut impl Reader) -> Result<Self, ssh_encoding::Error> {
        let host = String::decode(r)?;
        let port = u32::decode(r)?;
        let originator_host = String::decode(r)?;
        let originator_port = u32::decode(r)?;
        Ok(Self {
            host,
            port,
            originator_host,
            originator_port,
        })
    }

    fn encode(&self, w: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        self.host.as_str().encode(w)?;
        self.port.encode(w)?;
        self.originator_host.as_str().encode(w)?;
        self.originator_port.encode(w)
    }
}

/// Body of a `ChannelOpen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenKind {
    Session,
    DirectTcpIp(TcpIpParams),
    ForwardedTcpIp(TcpIpParams),
    Other { typ: String, data: Vec<u8> },
}

/// Body of a `GlobalRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestKind {
    TcpIpForward { host: String, port: u32 },
    CancelTcpIpForward { host: String, port: u32 },
    Other { name: String, data: Vec<u8> },
}

/// A pseudo-terminal request, stored verbatim on the session until a
/// shell or exec request starts the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    /// Encoded terminal modes, kept opaque.
    pub modes: Vec<u8>,
}

/// Body of a `ChannelRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestKind {
    Env {
        name: String,
        value: String,
    },
    Pty(PtyRequest),
    Shell,
    Exec {
        command: Vec<u8>,
    },
    ExitStatus {
        code: u32,
    },
    ExitSignal {
        signal: String,
        core_dumped: bool,
        message: String,
        lang: String,
    },
    Other {
        name: String,
        data: Vec<u8>,
    },
}

/// A connection-protocol message (numbers 80–100), plus `Disconnect`,
/// which the dispatcher needs for fatal teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Disconnect {
        reason: u32,
        description: String,
        language: String,
    },
    GlobalRequest {
        want_reply: bool,
        kind: GlobalRequestKind,
    },
    RequestSuccess,
    RequestFailure,
    ChannelOpen {
        sender: ChannelId,
        initial_window: u32,
        max_packet: u32,
        kind: ChannelOpenKind,
    },
    ChannelOpenConfirmation {
        recipient: ChannelId,
        sender: ChannelId,
        initial_window: u32,
        max_packet: u32,
    },
    ChannelOpenFailure {
        recipient: ChannelId,
        reason: OpenFailureReason,
        description: String,
        language: String,
    },
    ChannelWindowAdjust {
        recipient: ChannelId,
        bytes_to_add: u32,
    },
    ChannelData {
        recipient: ChannelId,
        data: Vec<u8>,
    },
    ChannelExtendedData {
        recipient: ChannelId,
        code: u32,
        data: Vec<u8>,
    },
    ChannelEof {
        recipient: ChannelId,
    },
    ChannelClose {
        recipient: ChannelId,
    },
    ChannelRequest {
        recipient: ChannelId,
        want_reply: bool,
        kind: ChannelRequestKind,
    },
    ChannelSuccess {
        recipient: ChannelId,
    },
    ChannelFailure {
        recipient: ChannelId,
    },
}

fn decode_bool(r: &mut impl Reader) -> Result<bool, ssh_encoding::Error> {
    Ok(u8::decode(r)? != 0)
}

fn encode_bool(value: bool, w: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
    u8::from(value).encode(w)
}

fn decode_channel_id(r: &mut impl Reader) -> Result<ChannelId, ssh_encoding::Error> {
    Ok(ChannelId(u32::decode(r)?))
}

/// Reads whatever is left of the payload, for `Other` bodies.
fn decode_rest(r: &mut impl Reader) -> Result<Vec<u8>, ssh_encoding::Error> {
    let mut rest = vec![0u8; r.remaining_len()];
    r.read(&mut rest)?;
    Ok(rest)
}

impl Message {
    /// Decode one framed payload. Fails on truncation, trailing garbage,
    /// an unknown message number or invalid UTF-8 in textual fields.
    pub fn decode(bytes: &[u8]) -> Result<Message, Error> {
        let mut r = bytes;
        let message = Self::decode_tagged(&mut r)?;
        if r.remaining_len() != 0 {
            return Err(Error::Malformed);
        }
        Ok(message)
    }

    fn decode_tagged(r: &mut &[u8]) -> Result<Message, Error> {
        let tag = u8::decode(r)?;
        Ok(match tag {
            msg::DISCONNECT => Message::Disconnect {
                reason: u32::decode(r)?,
                description: String::decode(r)?,
                language: String::decode(r)?,
            },
            msg::GLOBAL_REQUEST => {
                let name = String::decode(r)?;
                let want_reply = decode_bool(r)?;
                let kind = match name.as_str() {
                    "tcpip-forward" => GlobalRequestKind::TcpIpForward {
                        host: String::decode(r)?,
                        port: u32::decode(r)?,
                    },
                    "cancel-tcpip-forward" => GlobalRequestKind::CancelTcpIpForward {
                        host: String::decode(r)?,
                        port: u32::decode(r)?,
                    },
                    _ => GlobalRequestKind::Other {
                        name,
                        data: decode_rest(r)?,
                    },
                };
                Message::GlobalRequest { want_reply, kind }
            }
            msg::REQUEST_SUCCESS => Message::RequestSuccess,
            msg::REQUEST_FAILURE => Message::RequestFailure,
            msg::CHANNEL_OPEN => {
                // https://tools.ietf.org/html/rfc4254#section-5.1
                let typ = String::decode(r)?;
                let sender = decode_channel_id(r)?;
                let initial_window = u32::decode(r)?;
                let max_packet = u32::decode(r)?;
                let kind = match typ.as_str() {
                    "session" => ChannelOpenKind::Session,
                    "direct-tcpip" => ChannelOpenKind::DirectTcpIp(TcpIpParams::decode(r)?),
                    "forwarded-tcpip" => ChannelOpenKind::ForwardedTcpIp(TcpIpParams::decode(r)?),
                    _ => ChannelOpenKind::Other {
                        typ,
                        data: decode_rest(r)?,
                    },
                };
                Message::ChannelOpen {
                    sender,
                    initial_window,
                    max_packet,
                    kind,
                }
            }
            msg::CHANNEL_OPEN_CONFIRMATION => Message::ChannelOpenConfirmation {
                recipient: decode_channel_id(r)?,
                sender: decode_channel_id(r)?,
                initial_window: u32::decode(r)?,
                max_packet: u32::decode(r)?,
            },
            msg::CHANNEL_OPEN_FAILURE => Message::ChannelOpenFailure {
                recipient: decode_channel_id(r)?,
                reason: OpenFailureReason::from_u32(u32::decode(r)?),
                description: String::decode(r)?,
                language: String::decode(r)?,
            },
            msg::CHANNEL_WINDOW_ADJUST => Message::ChannelWindowAdjust {
                recipient: decode_channel_id(r)?,
                bytes_to_add: u32::decode(r)?,
            },
            msg::CHANNEL_DATA => Message::ChannelData {
                recipient: decode_channel_id(r)?,
                data: Vec::<u8>::decode(r)?,
            },
            msg::CHANNEL_EXTENDED_DATA => Message::ChannelExtendedData {
                recipient: decode_channel_id(r)?,
                code: u32::decode(r)?,
                data: Vec::<u8>::decode(r)?,
            },
            msg::CHANNEL_EOF => Message::ChannelEof {
                recipient: decode_channel_id(r)?,
            },
            msg::CHANNEL_CLOSE => Message::ChannelClose {
                recipient: decode_channel_id(r)?,
            },
            msg::CHANNEL_REQUEST => {
                let recipient = decode_channel_id(r)?;
                let name = String::decode(r)?;
                let want_reply = decode_bool(r)?;
                let kind = match name.as_str() {
                    "env" => ChannelRequestKind::Env {
                        name: String::decode(r)?,
                        value: String::decode(r)?,
                    },
                    "pty-req" => ChannelRequestKind::Pty(PtyRequest {
                        term: String::decode(r)?,
                        col_width: u32::decode(r)?,
                        row_height: u32::decode(r)?,
                        pix_width: u32::decode(r)?,
                        pix_height: u32::decode(r)?,
                        modes: Vec::<u8>::decode(r)?,
                    }),
                    "shell" => ChannelRequestKind::Shell,
                    "exec" => ChannelRequestKind::Exec {
                        command: Vec::<u8>::decode(r)?,
                    },
                    "exit-status" => ChannelRequestKind::ExitStatus {
                        code: u32::decode(r)?,
                    },
                    "exit-signal" => ChannelRequestKind::ExitSignal {
                        signal: String::decode(r)?,
                        core_dumped: decode_bool(r)?,
                        message: String::decode(r)?,
                        lang: String::decode(r)?,
                    },
                    _ => ChannelRequestKind::Other {
                        name,
                        data: decode_rest(r)?,
                    },
                };
                Message::ChannelRequest {
                    recipient,
                    want_reply,
                    kind,
                }
            }
            msg::CHANNEL_SUCCESS => Message::ChannelSuccess {
                recipient: decode_channel_id(r)?,
            },
            msg::CHANNEL_FAILURE => Message::ChannelFailure {
                recipient: decode_channel_id(r)?,
            },
            _ => return Err(Error::Malformed),
        })
    }

    /// Encode to a framed payload.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    fn encode_into(&self, w: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        match self {
            Message::Disconnect {
                reason,
                description,
                language,
            } => {
                msg::DISCONNECT.encode(w)?;
                reason.encode(w)?;
                description.as_str().encode(w)?;
                language.as_str().encode(w)
            }
            Message::GlobalRequest { want_reply, kind } => {
                msg::GLOBAL_REQUEST.encode(w)?;
                match kind {
                    GlobalRequestKind::TcpIpForward { host, port } => {
                        "tcpip-forward".encode(w)?;
                        encode_bool(*want_reply, w)?;
                        host.as_str().encode(w)?;
                        port.encode(w)
                    }
                    GlobalRequestKind::CancelTcpIpForward { host, port } => {
                        "cancel-tcpip-forward".encode(w)?;
                        encode_bool(*want_reply, w)?;
                        host.as_str().encode(w)?;
                        port.encode(w)
                    }
                    GlobalRequestKind::Other { name, data } => {
                        name.as_str().encode(w)?;
                        encode_bool(*want_reply, w)?;
                        w.write(data)
                    }
                }
            }
            Message::RequestSuccess => msg::REQUEST_SUCCESS.encode(w),
            Message::RequestFailure => msg::REQUEST_FAILURE.encode(w),
            Message::ChannelOpen {
                sender,
                initial_window,
                max_packet,
                kind,
            } => {
                msg::CHANNEL_OPEN.encode(w)?;
                let typ = match kind {
                    ChannelOpenKind::Session => "session",
                    ChannelOpenKind::DirectTcpIp(_) => "direct-tcpip",
                    ChannelOpenKind::ForwardedTcpIp(_) => "forwarded-tcpip",
                    ChannelOpenKind::Other { typ, .. } => typ.as_str(),
                };
                typ.encode(w)?;
                sender.0.encode(w)?;
                initial_window.encode(w)?;
                max_packet.encode(w)?;
                match kind {
                    ChannelOpenKind::Session => Ok(()),
                    ChannelOpenKind::DirectTcpIp(params)
                    | ChannelOpenKind::ForwardedTcpIp(params) => params.encode(w),
                    ChannelOpenKind::Other { data, .. } => w.write(data),
                }
            }
            Message::ChannelOpenConfirmation {
                recipient,
                sender,
                initial_window,
                max_packet,
            } => {
                msg::CHANNEL_OPEN_CONFIRMATION.encode(w)?;
                recipient.0.encode(w)?;
                sender.0.encode(w)?;
                initial_window.encode(w)?;
                max_packet.encode(w)
            }
            Message::ChannelOpenFailure {
                recipient,
                reason,
                description,
                language,
            } => {
                msg::CHANNEL_OPEN_FAILURE.encode(w)?;
                recipient.0.encode(w)?;
                reason.to_u32().encode(w)?;
                description.as_str().encode(w)?;
                language.as_str().encode(w)
            }
            Message::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                msg::CHANNEL_WINDOW_ADJUST.encode(w)?;
                recipient.0.encode(w)?;
                bytes_to_add.encode(w)
            }
            Message::ChannelData { recipient, data } => {
                msg::CHANNEL_DATA.encode(w)?;
                recipient.0.encode(w)?;
                data.as_slice().encode(w)
            }
            Message::ChannelExtendedData {
                recipient,
                code,
                data,
            } => {
                msg::CHANNEL_EXTENDED_DATA.encode(w)?;
                recipient.0.encode(w)?;
                code.encode(w)?;
                data.as_slice().encode(w)
            }
            Message::ChannelEof { recipient } => {
                msg::CHANNEL_EOF.encode(w)?;
                recipient.0.encode(w)
            }
            Message::ChannelClose { recipient } => {
                msg::CHANNEL_CLOSE.encode(w)?;
                recipient.0.encode(w)
            }
            Message::ChannelRequest {
                recipient,
                want_reply,
                kind,
            } => {
                msg::CHANNEL_REQUEST.encode(w)?;
                recipient.0.encode(w)?;
                let name = match kind {
                    ChannelRequestKind::Env { .. } => "env",
                    ChannelRequestKind::Pty(_) => "pty-req",
                    ChannelRequestKind::Shell => "shell",
                    ChannelRequestKind::Exec { .. } => "exec",
                    ChannelRequestKind::ExitStatus { .. } => "exit-status",
                    ChannelRequestKind::ExitSignal { .. } => "exit-signal",
                    ChannelRequestKind::Other { name, .. } => name.as_str(),
                };
                name.encode(w)?;
                encode_bool(*want_reply, w)?;
                match kind {
                    ChannelRequestKind::Env { name, value } => {
                        name.as_str().encode(w)?;
                        value.as_str().encode(w)
                    }
                    ChannelRequestKind::Pty(pty) => {
                        pty.term.as_str().encode(w)?;
                        pty.col_width.encode(w)?;
                        pty.row_height.encode(w)?;
                        pty.pix_width.encode(w)?;
                        pty.pix_height.encode(w)?;
                        pty.modes.as_slice().encode(w)
                    }
                    ChannelRequestKind::Shell => Ok(()),
                    ChannelRequestKind::Exec { command } => command.as_slice().encode(w),
                    ChannelRequestKind::ExitStatus { code } => code.encode(w),
                    ChannelRequestKind::ExitSignal {
                        signal,
                        core_dumped,
                        message,
                        lang,
                    } => {
                        signal.as_str().encode(w)?;
                        encode_bool(*core_dumped, w)?;
                        message.as_str().encode(w)?;
                        lang.as_str().encode(w)
                    }
                    ChannelRequestKind::Other { data, .. } => w.write(data),
                }
            }
            Message::ChannelSuccess { recipient } => {
                msg::CHANNEL_SUCCESS.encode(w)?;
                recipient.0.encode(w)
            }
            Message::ChannelFailure { recipient } => {
                msg::CHANNEL_FAILURE.encode(w)?;
                recipient.0.encode(w)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Allow unwraps, expects and panics in the test suite
    #![allow(clippy::indexing_slicing)]

    use super::*;

    fn roundtrip(message: Message) {
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    fn tcpip_params() -> TcpIpParams {
        TcpIpParams {
            host: "server.example.com".into(),
            port: 8080,
            originator_host: "10.0.0.7".into(),
            originator_port: 49152,
        }
    }

    #[test]
    fn roundtrip_all_messages() {
        let samples = vec![
            Message::Disconnect {
                reason: 2,
                description: "protocol error".into(),
                language: "en".into(),
            },
            Message::GlobalRequest {
                want_reply: true,
                kind: GlobalRequestKind::TcpIpForward {
                    host: "0.0.0.0".into(),
                    port: 2222,
                },
            },
            Message::GlobalRequest {
                want_reply: false,
                kind: GlobalRequestKind::CancelTcpIpForward {
                    host: "::".into(),
                    port: 2222,
                },
            },
            Message::GlobalRequest {
                want_reply: true,
                kind: GlobalRequestKind::Other {
                    name: "hostkeys-00@openssh.com".into(),
                    data: vec![1, 2, 3],
                },
            },
            Message::RequestSuccess,
            Message::RequestFailure,
            Message::ChannelOpen {
                sender: ChannelId(1),
                initial_window: 32768,
                max_packet: 32768,
                kind: ChannelOpenKind::Session,
            },
            Message::ChannelOpen {
                sender: ChannelId(2),
                initial_window: 1024,
                max_packet: 512,
                kind: ChannelOpenKind::DirectTcpIp(tcpip_params()),
            },
            Message::ChannelOpen {
                sender: ChannelId(3),
                initial_window: 1024,
                max_packet: 512,
                kind: ChannelOpenKind::ForwardedTcpIp(tcpip_params()),
            },
            Message::ChannelOpen {
                sender: ChannelId(4),
                initial_window: 64,
                max_packet: 64,
                kind: ChannelOpenKind::Other {
                    typ: "x11".into(),
                    data: vec![0, 0, 0, 1, b'x'],
                },
            },
            Message::ChannelOpenConfirmation {
                recipient: ChannelId(1),
                sender: ChannelId(0),
                initial_window: 2097152,
                max_packet: 32768,
            },
            Message::ChannelOpenFailure {
                recipient: ChannelId(1),
                reason: OpenFailureReason::AdministrativelyProhibited,
                description: "open failed".into(),
                language: "en".into(),
            },
            Message::ChannelOpenFailure {
                recipient: ChannelId(1),
                reason: OpenFailureReason::Other(77),
                description: String::new(),
                language: String::new(),
            },
            Message::ChannelWindowAdjust {
                recipient: ChannelId(9),
                bytes_to_add: 600,
            },
            Message::ChannelData {
                recipient: ChannelId(9),
                data: b"hi".to_vec(),
            },
            Message::ChannelExtendedData {
                recipient: ChannelId(9),
                code: 1,
                data: b"oops".to_vec(),
            },
            Message::ChannelEof {
                recipient: ChannelId(9),
            },
            Message::ChannelClose {
                recipient: ChannelId(9),
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: true,
                kind: ChannelRequestKind::Env {
                    name: "LANG".into(),
                    value: "C.UTF-8".into(),
                },
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: false,
                kind: ChannelRequestKind::Pty(PtyRequest {
                    term: "xterm-256color".into(),
                    col_width: 80,
                    row_height: 24,
                    pix_width: 0,
                    pix_height: 0,
                    modes: vec![0],
                }),
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: true,
                kind: ChannelRequestKind::Shell,
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: true,
                kind: ChannelRequestKind::Exec {
                    command: b"echo".to_vec(),
                },
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: false,
                kind: ChannelRequestKind::ExitStatus { code: 0 },
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: false,
                kind: ChannelRequestKind::ExitSignal {
                    signal: "ILL".into(),
                    core_dumped: false,
                    message: String::new(),
                    lang: String::new(),
                },
            },
            Message::ChannelRequest {
                recipient: ChannelId(5),
                want_reply: true,
                kind: ChannelRequestKind::Other {
                    name: "window-change".into(),
                    data: vec![0, 0, 0, 80, 0, 0, 0, 24, 0, 0, 0, 0, 0, 0, 0, 0],
                },
            },
            Message::ChannelSuccess {
                recipient: ChannelId(5),
            },
            Message::ChannelFailure {
                recipient: ChannelId(5),
            },
        ];
        for message in samples {
            roundtrip(message);
        }
    }

    #[test]
    fn truncated_message_is_rejected() {
        let bytes = Message::ChannelData {
            recipient: ChannelId(1),
            data: b"payload".to_vec(),
        }
        .encode()
        .unwrap();
        for cut in 1..bytes.len() {
            assert!(Message::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = Message::ChannelEof {
            recipient: ChannelId(1),
        }
        .encode()
        .unwrap();
        bytes.push(0);
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_message_number_is_rejected() {
        assert!(Message::decode(&[42, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn unknown_channel_type_is_preserved() {
        let bytes = Message::ChannelOpen {
            sender: ChannelId(7),
            initial_window: 128,
            max_packet: 64,
            kind: ChannelOpenKind::Other {
                typ: "auth-agent@openssh.com".into(),
                data: vec![],
            },
        }
        .encode()
        .unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::ChannelOpen {
                kind: ChannelOpenKind::Other { typ, .. },
                ..
            } => assert_eq!(typ, "auth-agent@openssh.com"),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_in_type_is_rejected() {
        // A channel open whose type string is not UTF-8.
        let mut bytes = vec![msg::CHANNEL_OPEN, 0, 0, 0, 2, 0xff, 0xfe];
        bytes.extend_from_slice(&[0, 0, 0, 1]);
        bytes.extend_from_slice(&[0, 0, 4, 0]);
        bytes.extend_from_slice(&[0, 0, 2, 0]);
        assert!(Message::decode(&bytes).is_err());
    }
}

