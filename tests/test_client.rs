//! End-to-end scenarios: a real client connection against a real server
//! connection over the in-memory pipe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sshmux::connection::{SessionHandler, SessionIo, SessionRequest, TcpIpHandler, TcpIpIo};
use sshmux::stream::pipe;
use sshmux::wire::{OpenFailureReason, TcpIpParams};
use sshmux::{
    Address, Callbacks, Config, Connection, ConnectionHandle, Error, Exit, HandlerError,
    Switchboard,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn connect(
    server_callbacks: Callbacks,
    client_callbacks: Callbacks,
) -> (
    ConnectionHandle,
    ConnectionHandle,
    JoinHandle<Result<(), Error>>,
    JoinHandle<Result<(), Error>>,
) {
    let (server_side, client_side) = pipe(64);
    let (server, server_handle) = Connection::new(
        Config::default(),
        server_callbacks,
        Some("alice".into()),
        server_side,
    );
    let (client, client_handle) =
        Connection::new(Config::default(), client_callbacks, None, client_side);
    (
        server_handle,
        client_handle,
        tokio::spawn(server.run()),
        tokio::spawn(client.run()),
    )
}

/// Reads stdin to EOF, writes it back to stdout, warns on stderr.
struct EchoSession;

#[async_trait]
impl SessionHandler for EchoSession {
    async fn run(&self, _request: SessionRequest, mut io: SessionIo) -> Result<u32, HandlerError> {
        let mut input = Vec::new();
        io.stdin.read_to_end(&mut input).await?;
        io.stdout.write_all(&input).await?;
        io.stderr.write_all(b"warn").await?;
        Ok(7)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_roundtrip_with_exit_status() {
    env_logger::try_init().unwrap_or(());
    let server_callbacks = Callbacks {
        on_session: Some(Arc::new(EchoSession)),
        ..Default::default()
    };
    let (_server_handle, client_handle, server_task, client_task) =
        connect(server_callbacks, Callbacks::default());

    let mut session = client_handle.open_session().await.unwrap();
    assert!(session.exec("cat").await.unwrap());

    session.stdin.write_all(b"ping").await.unwrap();
    session.stdin.shutdown().await.unwrap();

    let mut stdout = Vec::new();
    session.stdout.read_to_end(&mut stdout).await.unwrap();
    assert_eq!(stdout, b"ping");
    let mut stderr = Vec::new();
    session.stderr.read_to_end(&mut stderr).await.unwrap();
    assert_eq!(stderr, b"warn");
    assert_eq!(
        session.exit_status().await.unwrap(),
        Exit::Status(7)
    );

    client_handle.close().await.unwrap();
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

struct FailingSession;

#[async_trait]
impl SessionHandler for FailingSession {
    async fn run(&self, _request: SessionRequest, _io: SessionIo) -> Result<u32, HandlerError> {
        Err("boom".into())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_failure_surfaces_as_exit_signal() {
    env_logger::try_init().unwrap_or(());
    let server_callbacks = Callbacks {
        on_session: Some(Arc::new(FailingSession)),
        ..Default::default()
    };
    let (_s, client_handle, _st, _ct) = connect(server_callbacks, Callbacks::default());

    let mut session = client_handle.open_session().await.unwrap();
    assert!(session.shell().await.unwrap());
    match session.exit_status().await.unwrap() {
        Exit::Signal { signal, core_dumped, .. } => {
            assert_eq!(signal, "ILL");
            assert!(!core_dumped);
        }
        other => panic!("expected a signal, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn session_is_refused_without_a_handler() {
    env_logger::try_init().unwrap_or(());
    let (_s, client_handle, _st, _ct) = connect(Callbacks::default(), Callbacks::default());

    match client_handle.open_session().await {
        Err(Error::ChannelOpenFailure(reason, _)) => {
            assert_eq!(reason, OpenFailureReason::AdministrativelyProhibited);
        }
        other => panic!("expected an open failure, got {other:?}"),
    }
}

/// Copies the tunnel input back to its output.
struct EchoTunnel;

#[async_trait]
impl TcpIpHandler for EchoTunnel {
    async fn run(&self, _params: TcpIpParams, mut io: TcpIpIo) -> Result<(), HandlerError> {
        tokio::io::copy(&mut io.rx, &mut io.tx).await?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_tcpip_echo() {
    env_logger::try_init().unwrap_or(());
    let server_callbacks = Callbacks {
        on_direct_tcpip: Some(Arc::new(EchoTunnel)),
        ..Default::default()
    };
    let (_s, client_handle, _st, _ct) = connect(server_callbacks, Callbacks::default());

    let params = TcpIpParams {
        host: "internal.example.com".into(),
        port: 5432,
        originator_host: "127.0.0.1".into(),
        originator_port: 41000,
    };
    let mut tunnel = client_handle.open_direct_tcpip(params).await.unwrap();
    tunnel.tx.write_all(b"tunnelled").await.unwrap();
    let mut buf = [0u8; 9];
    tunnel.rx.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnelled");

    tunnel.close();
    let mut rest = Vec::new();
    tunnel.rx.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarded_tcpip_through_the_switchboard() {
    env_logger::try_init().unwrap_or(());
    let switchboard = Arc::new(Switchboard::new());
    let server_callbacks = Callbacks {
        switchboard: Some(switchboard.clone()),
        ..Default::default()
    };
    let client_callbacks = Callbacks {
        on_forwarded_tcpip: Some(Arc::new(EchoTunnel)),
        ..Default::default()
    };
    let (_s, client_handle, _st, _ct) = connect(server_callbacks, client_callbacks);

    let bound = Address::new("127.0.0.1", 8022);
    assert!(client_handle.tcpip_forward("127.0.0.1", 8022).await.unwrap());
    // A duplicate registration is refused.
    assert!(!client_handle.tcpip_forward("127.0.0.1", 8022).await.unwrap());

    // Someone accepted a connection on the bound address; tunnel it back.
    let opener = switchboard.get_forwarding(&bound).expect("forwarding registered");
    let mut tunnel = opener
        .open(bound.clone(), Address::new("198.51.100.7", 40100))
        .await
        .unwrap();
    tunnel.tx.write_all(b"fwd").await.unwrap();
    let mut buf = [0u8; 3];
    tunnel.rx.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"fwd");
    tunnel.close();

    assert!(client_handle
        .cancel_tcpip_forward("127.0.0.1", 8022)
        .await
        .unwrap());
    assert!(switchboard.get_forwarding(&bound).is_none());
}

struct SlowSession;

#[async_trait]
impl SessionHandler for SlowSession {
    async fn run(&self, _request: SessionRequest, mut io: SessionIo) -> Result<u32, HandlerError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        io.stdout.write_all(b"late").await?;
        Ok(0)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_waits_for_channels_to_drain() {
    env_logger::try_init().unwrap_or(());
    let server_callbacks = Callbacks {
        on_session: Some(Arc::new(SlowSession)),
        ..Default::default()
    };
    let (_s, client_handle, server_task, client_task) =
        connect(server_callbacks, Callbacks::default());

    let mut session = client_handle.open_session().await.unwrap();
    assert!(session.exec("slow").await.unwrap());

    let closer = {
        let handle = client_handle.clone();
        tokio::spawn(async move { handle.close().await })
    };

    // The close must not cut the in-flight channel short.
    let mut stdout = Vec::new();
    session.stdout.read_to_end(&mut stdout).await.unwrap();
    assert_eq!(stdout, b"late");
    assert_eq!(session.exit_status().await.unwrap(), Exit::Status(0));

    timeout(Duration::from_secs(5), closer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
