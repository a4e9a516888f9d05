//! Reference resolution over arbitrary nested values.
//!
//! [`resolve_refs`] is the asynchronous decode direction: every string with
//! the reference prefix becomes the live replica it denotes, awaiting
//! construction where necessary. [`strip_refs`] is the synchronous encode
//! counterpart: every replica leaf becomes its token string.

use futures::future::{try_join_all, BoxFuture, FutureExt};

use commsync_proto::{format_ref, parse_ref};

use crate::error::SyncError;
use crate::registry::Registry;
use crate::value::Value;

/// Replace every reference token in `value` by the replica it denotes,
/// preserving container shape and order.
///
/// Nested resolutions run concurrently; the whole resolution fails if any
/// nested one fails. Inputs without tokens resolve to an equivalent copy.
pub fn resolve_refs<'a>(
    value: Value,
    registry: &'a dyn Registry,
) -> BoxFuture<'a, Result<Value, SyncError>> {
    async move {
        match value {
            Value::Str(s) => match parse_ref(&s) {
                Some(id) => Ok(Value::Replica(registry.resolve(&id).await?)),
                None => Ok(Value::Str(s)),
            },
            Value::Seq(items) => {
                let resolved =
                    try_join_all(items.into_iter().map(|item| resolve_refs(item, registry)))
                        .await?;
                Ok(Value::Seq(resolved))
            }
            Value::Map(map) => {
                let entries = try_join_all(map.into_iter().map(|(key, item)| async move {
                    Ok::<_, SyncError>((key, resolve_refs(item, registry).await?))
                }))
                .await?;
                Ok(Value::Map(entries.into_iter().collect()))
            }
            other => Ok(other),
        }
    }
    .boxed()
}

/// Replace every replica leaf in `value` by its reference token, preserving
/// container shape and order.
pub fn strip_refs(value: &Value) -> Value {
    match value {
        Value::Replica(replica) => Value::Str(format_ref(replica.id())),
        Value::Seq(items) => Value::Seq(items.iter().map(strip_refs).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), strip_refs(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::registry::{ModelRegistry, Registry};
    use crate::replica::Replica;
    use crate::schema::SchemaSet;
    use crate::value::structural_eq;
    use commsync_proto::ReplicaId;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn registry_with(ids: &[&str]) -> Arc<ModelRegistry> {
        let registry = ModelRegistry::new(SchemaSet::new(), Default::default());
        for id in ids {
            let replica = Replica::detached(
                ReplicaId::new(*id),
                "base",
                registry.schemas(),
                SyncConfig::default(),
            );
            registry.insert(replica).await;
        }
        registry
    }

    #[tokio::test]
    async fn test_nested_structure_resolves_in_shape() {
        let registry = registry_with(&["X", "Y"]).await;
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::str("ref://X"));
        map.insert(
            "b".to_string(),
            Value::Seq(vec![Value::str("ref://Y"), Value::Int(3)]),
        );
        let resolved = resolve_refs(Value::Map(map), registry.as_ref()).await.unwrap();
        match resolved {
            Value::Map(map) => {
                match &map["a"] {
                    Value::Replica(r) => assert_eq!(r.id().as_str(), "X"),
                    other => panic!("expected replica, got {other:?}"),
                }
                match &map["b"] {
                    Value::Seq(items) => {
                        assert!(matches!(&items[0], Value::Replica(r) if r.id().as_str() == "Y"));
                        assert_eq!(items[1], Value::Int(3));
                    }
                    other => panic!("expected sequence, got {other:?}"),
                }
            }
            other => panic!("expected mapping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_free_input_is_identity() {
        let registry = registry_with(&[]).await;
        let input = Value::Seq(vec![
            Value::Int(1),
            Value::str("plain"),
            Value::Map(BTreeMap::new()),
        ]);
        let resolved = resolve_refs(input.clone(), registry.as_ref()).await.unwrap();
        assert!(structural_eq(&input, &resolved));
    }

    #[tokio::test]
    async fn test_unknown_reference_fails_whole_resolution() {
        let registry = registry_with(&["X"]).await;
        let input = Value::Seq(vec![Value::str("ref://X"), Value::str("ref://missing")]);
        let err = resolve_refs(input, registry.as_ref()).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownReplica { .. }));
    }

    #[tokio::test]
    async fn test_strip_refs_is_encode_counterpart() {
        let registry = registry_with(&["X"]).await;
        let replica = registry.resolve(&ReplicaId::new("X")).await.unwrap();
        let value = Value::Map(
            [(
                "child".to_string(),
                Value::Seq(vec![Value::Replica(replica), Value::Bool(true)]),
            )]
            .into_iter()
            .collect(),
        );
        let stripped = strip_refs(&value);
        match stripped {
            Value::Map(map) => match &map["child"] {
                Value::Seq(items) => {
                    assert_eq!(items[0], Value::str("ref://X"));
                    assert_eq!(items[1], Value::Bool(true));
                }
                other => panic!("expected sequence, got {other:?}"),
            },
            other => panic!("expected mapping, got {other:?}"),
        }
    }
}
