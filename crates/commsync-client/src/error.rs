//! Error types for the synchronization engine.

use commsync_proto::{ProtoError, ReplicaId};
use thiserror::Error;

/// Errors that can occur in the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An attribute serializer failed; the whole flush is aborted and the
    /// pending diff is preserved for retry.
    #[error("attribute `{name}` failed to encode: {msg}")]
    Encode {
        /// The attribute whose serializer failed.
        name: String,
        /// Description of the failure.
        msg: String,
    },

    /// An inbound update failed to decode; the message is dropped and the
    /// attribute map left unchanged.
    #[error("update decode failed: {msg}")]
    Decode {
        /// Description of the failure.
        msg: String,
    },

    /// A flush was requested on a replica with no attached channel.
    #[error("replica `{id}` is detached from its channel")]
    Detached {
        /// The detached replica.
        id: ReplicaId,
    },

    /// The replica has already been closed.
    #[error("replica `{id}` is closed")]
    AlreadyClosed {
        /// The closed replica.
        id: ReplicaId,
    },

    /// A reference token named a replica the registry does not know.
    #[error("unknown replica: {id}")]
    UnknownReplica {
        /// The unresolvable replica id.
        id: ReplicaId,
    },

    /// The channel rejected an outbound frame; the payload is dropped.
    #[error("transmission failed: {msg}")]
    Transmit {
        /// Description of the channel failure.
        msg: String,
    },

    /// The binary payload list did not match the declared path list.
    #[error("buffer count mismatch: {expected} paths, {got} payloads")]
    BufferCount {
        /// Number of declared buffer paths.
        expected: usize,
        /// Number of binary payloads received.
        got: usize,
    },

    /// Wire-level protocol error.
    #[error("protocol error")]
    Proto(#[from] ProtoError),
}
