//! The seam to the transport layer.
//!
//! The connection core never touches sockets or crypto; it consumes a
//! stream of already-parsed protocol messages. A real transport wraps its
//! packet pipeline in these traits; tests use the in-memory [`pipe`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::wire::Message;
use crate::Error;

/// The inbound half: one framed message per call, `None` at end of
/// stream.
#[async_trait]
pub trait MessageSource: Send + 'static {
    async fn receive(&mut self) -> Result<Option<Message>, Error>;
}

/// The outbound half. `send` may block for transport backpressure.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, msg: Message) -> Result<(), Error>;
}

/// A full transport binding, split into its two halves by the connection:
/// the reader task becomes the sole consumer of the source, the writer
/// task the sole producer into the sink.
pub trait MessageStream: Send + 'static {
    type Source: MessageSource;
    type Sink: MessageSink;

    fn split(self) -> (Self::Source, Self::Sink);
}

/// Creates a connected pair of in-memory transports. Messages are encoded
/// to their wire form on send and decoded on receive, so the codec is
/// exercised on every hop.
pub fn pipe(capacity: usize) -> (PipeStream, PipeStream) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        PipeStream {
            tx: a_tx,
            rx: b_rx,
        },
        PipeStream {
            tx: b_tx,
            rx: a_rx,
        },
    )
}

pub struct PipeStream {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

pub struct PipeSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

pub struct PipeSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl MessageStream for PipeStream {
    type Source = PipeSource;
    type Sink = PipeSink;

    fn split(self) -> (PipeSource, PipeSink) {
        (PipeSource { rx: self.rx }, PipeSink { tx: self.tx })
    }
}

#[async_trait]
impl MessageSource for PipeSource {
    async fn receive(&mut self) -> Result<Option<Message>, Error> {
        match self.rx.recv().await {
            Some(bytes) => Ok(Some(Message::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MessageSink for PipeSink {
    async fn send(&mut self, msg: Message) -> Result<(), Error> {
        let bytes = msg.encode()?;
        self.tx.send(bytes).await.map_err(|_| Error::SendError)
    }
}

impl PipeStream {
    /// Sends one message without splitting, for tests that script a peer
    /// by hand.
    pub async fn send(&self, msg: Message) -> Result<(), Error> {
        let bytes = msg.encode()?;
        self.tx.send(bytes).await.map_err(|_| Error::SendError)
    }

    /// Receives one message without splitting.
    pub async fn receive(&mut self) -> Result<Option<Message>, Error> {
        match self.rx.recv().await {
            Some(bytes) => Ok(Some(Message::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
