//! Error types for the dev bridge.

use thiserror::Error;

/// Errors that can occur while starting or running the bridge.
#[derive(Debug, Error)]
pub enum Error {
    /// The AppSync connection failed.
    #[error(transparent)]
    Connection(#[from] appsync_events::Error),

    /// The bridge protocol layer failed.
    #[error(transparent)]
    Bridge(#[from] bridge_protocol::Error),

    /// Configuration error.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),

    /// Binding or serving the local adapter failed.
    #[error("local server error")]
    Io(#[from] std::io::Error),
}

impl From<Box<figment::Error>> for Error {
    fn from(err: Box<figment::Error>) -> Self {
        Error::Config(err)
    }
}

/// A specialised Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
