//! The attribute value variant and its structural equality.
//!
//! Every attribute of a replica holds one [`Value`]: a JSON-compatible
//! scalar or container, an opaque binary buffer, or a live reference to
//! another replica. Containers use `BTreeMap`, so traversal order is
//! deterministic — buffer-path recording depends on that.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::replica::Replica;

/// An attribute value.
#[derive(Debug, Clone)]
pub enum Value {
    /// JSON null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// String scalar.
    Str(String),
    /// Opaque binary buffer, carried out-of-band on the wire.
    Binary(Bytes),
    /// Ordered sequence.
    Seq(Vec<Value>),
    /// Key-ordered mapping.
    Map(BTreeMap<String, Value>),
    /// A live reference to another replica.
    Replica(Arc<Replica>),
}

impl Value {
    /// Shorthand for a string value.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Shorthand for a binary value.
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Value::Binary(bytes.into())
    }

    /// Whether this value or any nested value is a binary buffer.
    pub fn contains_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            Value::Seq(items) => items.iter().any(Value::contains_binary),
            Value::Map(map) => map.values().any(Value::contains_binary),
            _ => false,
        }
    }
}

/// Explicit structural equality over the value variant.
///
/// Scalars and containers compare by content; replica references compare by
/// id. Floats compare by numeric equality, so two NaN values are unequal.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Binary(x), Value::Binary(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| structural_eq(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|((ka, va), (kb, vb))| ka == kb && structural_eq(va, vb))
        }
        (Value::Replica(x), Value::Replica(y)) => x.id() == y.id(),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        structural_eq(self, other)
    }
}

/// Convert a JSON tree into a [`Value`] tree.
///
/// Integral numbers map to [`Value::Int`], all others to [`Value::Float`].
pub fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::Seq(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, from_json(v)))
                .collect(),
        ),
    }
}

/// Convert a [`Value`] tree into a JSON tree.
///
/// Fails on [`Value::Binary`] (binaries must be extracted first) and on
/// [`Value::Replica`] (references must be encoded to tokens first).
pub fn to_json(value: &Value) -> Result<serde_json::Value, SyncError> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Int(i) => Ok(serde_json::Value::from(*i)),
        Value::Float(f) => Ok(serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        Value::Str(s) => Ok(serde_json::Value::String(s.clone())),
        Value::Binary(_) => Err(SyncError::Encode {
            name: String::new(),
            msg: "binary value not extracted before JSON conversion".to_string(),
        }),
        Value::Seq(items) => Ok(serde_json::Value::Array(
            items.iter().map(to_json).collect::<Result<_, _>>()?,
        )),
        Value::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), to_json(v)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Replica(r) => Err(SyncError::Encode {
            name: String::new(),
            msg: format!("unencoded replica reference `{}`", r.id()),
        }),
    }
}
