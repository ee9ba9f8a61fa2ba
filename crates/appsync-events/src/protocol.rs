//! Frame types of the AppSync Events realtime protocol (the subset the
//! bridge uses).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Frames sent by the client over the WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientFrame {
    /// Opens the protocol after the socket is established.
    ConnectionInit,
    /// Subscribes to a channel.
    Subscribe {
        id: String,
        channel: String,
        authorization: BTreeMap<String, String>,
    },
}

/// Frames received from the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerFrame {
    /// Handshake acknowledgement carrying the keep-alive window.
    ConnectionAck {
        #[serde(rename = "connectionTimeoutMs")]
        connection_timeout_ms: u64,
    },
    /// Keep-alive tick.
    Ka,
    /// A subscribe completed server-side.
    SubscribeSuccess { id: String },
    /// A subscribe was rejected.
    SubscribeError {
        id: Option<String>,
        #[serde(default)]
        errors: serde_json::Value,
    },
    /// An event published to a subscribed channel.
    Data { id: String, event: String },
    /// Anything this client does not handle.
    #[serde(other)]
    Unknown,
}
