//! Framing writer: buffers an outgoing byte stream and publishes it as
//! ordered packets.

use appsync_events::Connection;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use crate::error::Result;
use crate::packet::{MessageKind, Packet};

/// Maximum payload carried by one packet. Also the memory bound per
/// in-flight stream: a writer never holds more than one buffer.
pub const BUFFER_SIZE: usize = 128 * 1024;

/// Writes one logical message as a sequence of packets on a channel.
///
/// Bytes are buffered up to [`BUFFER_SIZE`] and flushed as one packet per
/// full buffer; [`BridgeWriter::close`] flushes the remainder with
/// `final=true`. Publishes are synchronous with respect to the caller.
pub struct BridgeWriter {
    conn: Connection,
    channel: String,
    kind: MessageKind,
    source: String,
    id: String,
    buffer: Vec<u8>,
    index: u32,
}

impl BridgeWriter {
    pub(crate) fn new(
        conn: Connection,
        kind: MessageKind,
        channel: String,
        source: String,
        id: String,
    ) -> Self {
        Self {
            conn,
            channel,
            kind,
            source,
            id,
            buffer: Vec::with_capacity(BUFFER_SIZE),
            index: 0,
        }
    }

    /// The message id of this stream. Matches the id packets go out under,
    /// so responses can be correlated with the request that minted it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Appends bytes to the stream, flushing full buffers as packets.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let space = BUFFER_SIZE - self.buffer.len();
            let take = space.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == BUFFER_SIZE {
                self.flush(false).await?;
            }
        }
        Ok(())
    }

    /// Serializes `body` as JSON onto the stream.
    pub async fn write_json<T: Serialize>(&mut self, body: &T) -> Result<()> {
        let encoded = serde_json::to_vec(body)?;
        self.write(&encoded).await
    }

    /// Flushes any buffered bytes and terminates the message with a
    /// `final=true` packet.
    pub async fn close(mut self) -> Result<()> {
        self.flush(true).await
    }

    async fn flush(&mut self, is_final: bool) -> Result<()> {
        if !is_final && self.buffer.is_empty() {
            return Ok(());
        }
        let packet = Packet {
            kind: self.kind,
            source: self.source.clone(),
            id: self.id.clone(),
            index: self.index,
            data: BASE64.encode(&self.buffer),
            is_final,
        };
        self.index += 1;
        self.buffer.clear();
        self.conn.publish(&self.channel, &packet).await?;
        Ok(())
    }
}
