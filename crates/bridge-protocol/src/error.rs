//! Error types for the bridge protocol layer.

use thiserror::Error;

/// Errors that can occur while framing or reassembling bridge traffic.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying connection rejected a publish.
    #[error("transport error")]
    Transport(#[from] appsync_events::Error),

    /// A packet or body failed to encode.
    #[error("encoding failed")]
    Encode(#[from] serde_json::Error),

    /// A tunneled HTTP message was malformed.
    #[error("invalid http message: {0}")]
    InvalidHttp(String),

    /// I/O failure while streaming a message body.
    #[error("body stream error")]
    Io(#[from] std::io::Error),
}

/// A specialised Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
