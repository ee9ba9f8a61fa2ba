//! # Bridge Protocol
//!
//! Message framing for the live-lambda dev bridge. AppSync Events delivers
//! independent pub/sub messages; this crate layers ordered, arbitrarily
//! large byte streams on top of it:
//!
//! - [`Packet`] is the wire frame: up to 128 KiB of one logical message,
//!   tagged with `{type, source, id, index, final}` and base64-encoded.
//! - [`BridgeWriter`] frames an outgoing byte stream into packets, flushing
//!   on buffer-full and on close.
//! - [`Reassembler`] restores per-id index order on the receive side,
//!   yielding each byte exactly once regardless of delivery permutation.
//! - [`Client`] multiplexes many logical messages over one connection and
//!   surfaces each incoming message as a streaming [`BodyReader`].
//! - [`wire`] carries HTTP requests and responses through those streams so
//!   the Lambda Runtime API can be tunneled end to end.
//!
//! Message ids are minted by [`ids::ascending`]: their lexicographic order
//! follows creation time, which lets receivers treat ids as an arrival
//! clock.

pub mod channels;
pub mod client;
pub mod error;
pub mod ids;
pub mod packet;
pub mod reassembly;
pub mod wire;
pub mod writer;

pub use client::{BodyReader, Client, Message};
pub use error::{Error, Result};
pub use packet::{
    InitBody, MessageKind, Packet, PingBody, RebootBody, TaskCompleteBody, TaskStartBody,
};
pub use reassembly::{Reassembler, SortedPackets};
pub use writer::{BUFFER_SIZE, BridgeWriter};
