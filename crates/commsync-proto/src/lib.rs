#![warn(missing_docs)]

//! commsync wire protocol: message shapes, buffer paths, reference tokens, status events.
//!
//! This crate defines the structured half of the channel protocol. Binary
//! payloads are never embedded in the structured tree; they travel alongside
//! each message as an out-of-band list, addressed by [`path::BufferPath`].

pub mod error;
pub mod id;
pub mod message;
pub mod path;
pub mod reference;

pub use error::ProtoError;
pub use id::ReplicaId;
pub use message::{ExecutionStatus, SendId, StatusEvent, WireMessage};
pub use path::{BufferPath, PathSeg};
pub use reference::{format_ref, parse_ref, REF_PREFIX};
