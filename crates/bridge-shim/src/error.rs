//! Error types for the shims.

use thiserror::Error;

/// Errors that can abort a shim.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),

    /// A required environment variable is missing.
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    /// The AppSync connection failed.
    #[error(transparent)]
    Connection(#[from] appsync_events::Error),

    /// The bridge protocol layer failed.
    #[error(transparent)]
    Bridge(#[from] bridge_protocol::Error),

    /// A Lambda Runtime API call failed.
    #[error("runtime api error")]
    RuntimeApi(#[from] reqwest::Error),

    /// Credentials could not be retrieved.
    #[error("failed to retrieve AWS credentials")]
    Credentials(#[source] aws_credential_types::provider::error::CredentialsError),
}

impl From<Box<figment::Error>> for Error {
    fn from(err: Box<figment::Error>) -> Self {
        Error::Config(err)
    }
}

/// A specialised Result type for shim operations.
pub type Result<T> = std::result::Result<T, Error>;
