//! The packet wire format and typed message bodies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of a logical message. Encoded on the wire as its integer
/// discriminant; unknown discriminants are protocol errors and the packet
/// carrying them is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    /// Worker announces itself: function id plus environment.
    Init = 0,
    /// Liveness / invocation-pending signal, both directions.
    Ping = 1,
    /// The buffered Runtime API response carrying the next invocation.
    Next = 2,
    /// A tunneled invocation-response exchange.
    Response = 3,
    /// A tunneled invocation-error exchange.
    Error = 4,
    /// Ask a worker to restart and re-announce itself.
    Reboot = 5,
    /// A tunneled init-error exchange.
    InitError = 6,
    /// A container task announces itself.
    TaskStart = 7,
    /// A container task finished.
    TaskComplete = 8,
}

/// Raised when a packet carries a discriminant this build does not know.
#[derive(Debug, Error)]
#[error("unknown message kind {0}")]
pub struct UnknownMessageKind(pub u8);

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(value: u8) -> Result<Self, UnknownMessageKind> {
        match value {
            0 => Ok(MessageKind::Init),
            1 => Ok(MessageKind::Ping),
            2 => Ok(MessageKind::Next),
            3 => Ok(MessageKind::Response),
            4 => Ok(MessageKind::Error),
            5 => Ok(MessageKind::Reboot),
            6 => Ok(MessageKind::InitError),
            7 => Ok(MessageKind::TaskStart),
            8 => Ok(MessageKind::TaskComplete),
            other => Err(UnknownMessageKind(other)),
        }
    }
}

/// One wire frame. Packets sharing an `id` form one logical message whose
/// byte order is given by `index`; `final` marks the last frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Identity of the sender (a worker id, or `"dev"` for the local side).
    pub source: String,
    /// Message id, shared by all packets of one message.
    pub id: String,
    /// Position of this frame within the message.
    pub index: u32,
    /// Base64-encoded payload bytes.
    pub data: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Body of an `Init` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitBody {
    #[serde(rename = "functionID")]
    pub function_id: String,
    pub environment: Vec<String>,
}

/// Body of a `Ping` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingBody {}

/// Body of a `Reboot` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebootBody {}

/// Body of a `TaskStart` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartBody {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub environment: Vec<String>,
}

/// Body of a `TaskComplete` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCompleteBody {}
