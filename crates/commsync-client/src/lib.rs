#![warn(missing_docs)]

//! commsync client engine: replicated attribute maps synchronized with a
//! kernel over an ordered duplex channel.
//!
//! The engine keeps each replica's attribute map consistent with its
//! kernel-side counterpart: local mutations compose into a pending diff and
//! flush through a single-credit throttle with coalescing; remote updates
//! decode asynchronously (binary reinsertion, per-attribute codecs,
//! reference resolution) and apply strictly in arrival order under echo
//! suppression.

pub mod buffers;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
mod inbound;
pub mod registry;
pub mod replica;
pub mod resolve;
pub mod schema;
pub mod sync;
pub mod value;

pub use channel::{memory_channel, Channel, ChannelEvent, MemoryChannel, MemoryKernel, SentFrame};
pub use codec::{AttrCodec, DefaultCodec};
pub use config::{RegistryConfig, SyncConfig};
pub use error::SyncError;
pub use events::{EventBus, ReplicaEvent};
pub use registry::{ModelRegistry, Registry};
pub use replica::{Replica, View};
pub use schema::{AttrSchema, SchemaSet, VariantSpec, VARIANT_ATTR};
pub use sync::{FlushKind, SyncEngine, SyncTicket};
pub use value::{structural_eq, Value};
