//! The bridge client: multiplexes logical messages over one connection.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use appsync_events::Connection;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ids;
use crate::packet::MessageKind;
use crate::reassembly::SortedPackets;
use crate::writer::BridgeWriter;

/// Bound on undelivered incoming messages.
const MESSAGE_BUFFER: usize = 1000;

/// Bound on undelivered body chunks per message.
const CHUNK_BUFFER: usize = 100;

/// One incoming logical message with a streaming body.
pub struct Message {
    pub kind: MessageKind,
    /// Message id; for tunneled responses this equals the originating
    /// request id.
    pub id: String,
    /// Identity of the sender.
    pub source: String,
    /// The message payload, delivered in arrival order as the packets land.
    pub body: BodyReader,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("source", &self.source)
            .finish()
    }
}

/// A handle for sending on the bridge. Cheap to clone; the stream of
/// incoming messages is handed out once by [`Client::start`].
#[derive(Clone)]
pub struct Client {
    conn: Connection,
    source: String,
}

impl Client {
    /// Subscribes to `inbox` and starts the demultiplexing task.
    ///
    /// Returns the client plus the channel of incoming messages. The channel
    /// closes when the connection tears down.
    pub async fn start(
        conn: Connection,
        source: impl Into<String>,
        inbox: &str,
    ) -> Result<(Client, mpsc::Receiver<Message>)> {
        let subscription = conn.subscribe(inbox).await?;
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);

        tokio::spawn(demultiplex(SortedPackets::new(subscription), message_tx));

        Ok((
            Client {
                conn,
                source: source.into(),
            },
            message_rx,
        ))
    }

    /// The identity stamped onto outgoing packets.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Opens a writer for a new message with a freshly minted id.
    pub fn writer(&self, kind: MessageKind, channel: &str) -> BridgeWriter {
        self.writer_with_id(kind, channel, ids::ascending())
    }

    /// Opens a writer that reuses an existing id, for replies that must
    /// correlate with the request that created them.
    pub fn writer_with_id(&self, kind: MessageKind, channel: &str, id: String) -> BridgeWriter {
        BridgeWriter::new(
            self.conn.clone(),
            kind,
            channel.to_string(),
            self.source.clone(),
            id,
        )
    }
}

/// Reads sorted packets and surfaces them as messages with streaming bodies.
async fn demultiplex(mut sorted: SortedPackets, message_tx: mpsc::Sender<Message>) {
    let mut open: HashMap<String, mpsc::Sender<Bytes>> = HashMap::new();

    while let Some(packet) = sorted.next().await {
        let data = match BASE64.decode(&packet.data) {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(id = %packet.id, error = %err, "dropping undecodable packet");
                continue;
            }
        };

        let chunk_tx = match open.get(&packet.id) {
            Some(sender) => sender.clone(),
            None => {
                let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
                open.insert(packet.id.clone(), chunk_tx.clone());
                let message = Message {
                    kind: packet.kind,
                    id: packet.id.clone(),
                    source: packet.source.clone(),
                    body: BodyReader::new(chunk_rx),
                };
                if message_tx.send(message).await.is_err() {
                    // Consumer is gone; stop demultiplexing.
                    return;
                }
                chunk_tx
            }
        };

        if !data.is_empty() {
            let _ = chunk_tx.send(Bytes::from(data)).await;
        }
        if packet.is_final {
            // Dropping the sender ends the body stream.
            open.remove(&packet.id);
        }
    }
    // Subscription closed: dropping `open` unblocks every pending read
    // with EOF.
}

/// A blocking byte stream over a message's packet chunks.
///
/// Returns EOF after the final packet has been consumed, or when the
/// connection (and with it the chunk channel) goes away.
pub struct BodyReader {
    chunks: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl BodyReader {
    fn new(chunks: mpsc::Receiver<Bytes>) -> Self {
        Self {
            chunks,
            current: Bytes::new(),
        }
    }

    /// Reads the entire body and decodes it as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

impl AsyncRead for BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.current = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
