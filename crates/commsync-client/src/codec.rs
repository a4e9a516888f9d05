//! Per-attribute wire codecs.
//!
//! A codec owns exactly two operations: a synchronous `encode` used on the
//! outbound path and an asynchronous `decode` used on the inbound path.
//! Attributes without a registered codec fall back to [`DefaultCodec`].

use async_trait::async_trait;

use crate::error::SyncError;
use crate::registry::Registry;
use crate::replica::Replica;
use crate::resolve::{resolve_refs, strip_refs};
use crate::value::Value;

/// Wire codec for one attribute.
#[async_trait]
pub trait AttrCodec: Send + Sync {
    /// Encode a value for the wire.
    ///
    /// Runs synchronously during flush; a failure aborts the whole flush and
    /// preserves the pending diff.
    fn encode(&self, value: &Value, owner: &Replica) -> Result<Value, SyncError>;

    /// Decode a wire value, resolving any embedded replica references
    /// through `registry`.
    async fn decode(&self, value: Value, registry: &dyn Registry) -> Result<Value, SyncError>;
}

/// Fallback codec: structural deep copy with reference substitution.
///
/// Encode replaces replica leaves by their tokens; decode resolves tokens
/// back to live replicas and is otherwise the identity.
#[derive(Debug, Default)]
pub struct DefaultCodec;

#[async_trait]
impl AttrCodec for DefaultCodec {
    fn encode(&self, value: &Value, _owner: &Replica) -> Result<Value, SyncError> {
        Ok(strip_refs(value))
    }

    async fn decode(&self, value: Value, registry: &dyn Registry) -> Result<Value, SyncError> {
        resolve_refs(value, registry).await
    }
}
