//! Wire message shapes for the channel protocol.
//!
//! The structured payload is JSON; binary payloads travel alongside each
//! message as an out-of-band list addressed by `buffer_paths`. Execution
//! status events arrive on a side channel and are correlated with a specific
//! outbound send through its [`SendId`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtoError;
use crate::path::BufferPath;

/// Identifier correlating an outbound send with its kernel acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendId(pub u64);

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send-{}", self.0)
    }
}

/// Kernel execution status reported on the side channel.
///
/// Only `idle` releases send credit; `busy` and `starting` are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// The kernel is starting up.
    Starting,
    /// The kernel is executing.
    Busy,
    /// The kernel finished processing; acknowledges the correlated send.
    Idle,
}

/// A status event correlated with a specific outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The reported execution status.
    pub status: ExecutionStatus,
    /// The outbound send this status refers to.
    pub parent: SendId,
}

/// Structured payload of a channel message.
///
/// `update` carries partial or whole replica state with its binary leaves
/// extracted; `custom` carries opaque application content. Both travel with
/// an out-of-band binary payload list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum WireMessage {
    /// Replica state, whole or partial, binaries extracted to `buffer_paths`.
    Update {
        /// The structured state tree, free of binary leaves.
        state: serde_json::Value,
        /// Paths at which the out-of-band binaries belong, in list order.
        buffer_paths: Vec<BufferPath>,
    },
    /// Opaque application content, delivered as a one-shot event.
    Custom {
        /// The structured content tree.
        content: serde_json::Value,
    },
}

impl WireMessage {
    /// The method tag of this message.
    pub fn method(&self) -> &'static str {
        match self {
            WireMessage::Update { .. } => "update",
            WireMessage::Custom { .. } => "custom",
        }
    }

    /// Serialize to the JSON tree sent over the channel.
    pub fn to_json(&self) -> Result<serde_json::Value, ProtoError> {
        serde_json::to_value(self).map_err(|e| ProtoError::MalformedMessage { msg: e.to_string() })
    }

    /// Parse a message from its JSON tree.
    ///
    /// An unrecognized method tag is a protocol error, reported as
    /// [`ProtoError::UnknownMethod`] rather than a generic parse failure.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ProtoError> {
        let method = value
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ProtoError::MalformedMessage {
                msg: "missing method tag".to_string(),
            })?;
        match method.as_str() {
            "update" | "custom" => serde_json::from_value(value)
                .map_err(|e| ProtoError::MalformedMessage { msg: e.to_string() }),
            _ => Err(ProtoError::UnknownMethod { method }),
        }
    }
}
