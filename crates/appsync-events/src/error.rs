//! Error types for the AppSync Events connection.

use thiserror::Error;

/// Errors that can occur while dialing or using a connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The WebSocket could not be established or the handshake failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No `subscribe_success` arrived within the handshake window.
    #[error("subscription failed for channel {channel}")]
    SubscriptionFailed {
        /// Channel the subscribe was issued for.
        channel: String,
    },

    /// A publish POST was rejected by the events endpoint.
    #[error("publish to {channel} failed with status {status}: {body}")]
    PublishFailed {
        /// Target channel.
        channel: String,
        /// HTTP status returned by the endpoint.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// Credentials could not be retrieved from the provider chain.
    #[error("failed to retrieve AWS credentials")]
    Credentials(#[source] aws_credential_types::provider::error::CredentialsError),

    /// Request signing failed.
    #[error("failed to sign request: {0}")]
    Signing(String),

    /// The SDK config is missing a region or credentials provider.
    #[error("incomplete AWS config: {0}")]
    IncompleteConfig(&'static str),

    /// Transport-level HTTP failure while publishing.
    #[error("publish transport error")]
    Transport(#[from] reqwest::Error),

    /// A frame or event body failed to serialize.
    #[error("serialization failed")]
    Json(#[from] serde_json::Error),
}

/// A specialised Result type for connection operations.
pub type Result<T> = std::result::Result<T, Error>;
