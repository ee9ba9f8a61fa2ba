//! # AppSync Events Connection
//!
//! A realtime client for the AWS AppSync Events WebSocket protocol, used as
//! the transport for the live-lambda dev bridge.
//!
//! The crate maintains a single WebSocket per [`Connection`] and multiplexes
//! any number of channel subscriptions over it. Publishes go out-of-band as
//! SigV4-signed HTTP POSTs to the events endpoint.
//!
//! ## Overview
//!
//! - [`Connection::dial`] opens the socket, performs the `connection_init` /
//!   `connection_ack` handshake, and spawns a driver task that reads frames,
//!   enforces the server-reported keep-alive timeout, and reconnects with a
//!   bounded backoff when the socket dies.
//! - [`Connection::subscribe`] registers a channel subscription and returns a
//!   [`Subscription`] whose output survives reconnects: after the socket is
//!   re-established every known subscription is replayed with its original
//!   id and sink.
//! - [`Connection::publish`] posts events to a channel over HTTPS.
//!
//! Authentication follows the AppSync Events scheme: each connect and
//! subscribe carries the header set of a SigV4-signed POST to the HTTP
//! endpoint, and the WebSocket itself is opened with the
//! `aws-appsync-event-ws` subprotocol plus a base64url-encoded copy of those
//! headers.
//!
//! ```no_run
//! use appsync_events::{AuthConfig, Connection};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), appsync_events::Error> {
//! let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//! let auth = AuthConfig::from_sdk_config(&cfg)?;
//! let token = CancellationToken::new();
//!
//! let conn = Connection::dial(
//!     token.clone(),
//!     auth,
//!     "example.appsync-api.us-east-1.amazonaws.com",
//!     "example.appsync-realtime-api.us-east-1.amazonaws.com",
//! )
//! .await?;
//!
//! let mut sub = conn.subscribe("/sst/my-app/dev/in").await?;
//! while let Some(event) = sub.recv().await {
//!     println!("event: {event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod connection;
pub mod error;
pub(crate) mod protocol;

pub use auth::AuthConfig;
pub use connection::{Connection, Subscription};
pub use error::{Error, Result};
