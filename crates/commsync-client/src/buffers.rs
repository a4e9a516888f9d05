//! Buffer extraction codec.
//!
//! The wire protocol never embeds binary data in the structured JSON tree.
//! [`remove_buffers`] splits a state tree into (tree without binaries, list
//! of paths, list of payloads); [`put_buffers`] is its inverse. Binary map
//! entries are removed from the tree, binary sequence slots become `null` so
//! sibling indices stay valid. Paths are recorded in one deterministic
//! depth-first walk, so identical input yields identical path order.

use bytes::Bytes;
use std::collections::BTreeMap;

use commsync_proto::{BufferPath, PathSeg, ProtoError};

use crate::error::SyncError;
use crate::value::{self, Value};

/// Split a state map into its structured JSON tree, buffer paths, and
/// binary payloads.
pub fn remove_buffers(
    state: &BTreeMap<String, Value>,
) -> Result<(serde_json::Value, Vec<BufferPath>, Vec<Bytes>), SyncError> {
    let mut paths = Vec::new();
    let mut payloads = Vec::new();
    let mut tree = serde_json::Map::new();
    for (name, val) in state {
        let path = BufferPath::root().child(name.as_str());
        if let Some(json) = extract(val, &path, &mut paths, &mut payloads)? {
            tree.insert(name.clone(), json);
        }
    }
    Ok((serde_json::Value::Object(tree), paths, payloads))
}

fn extract(
    value: &Value,
    path: &BufferPath,
    paths: &mut Vec<BufferPath>,
    payloads: &mut Vec<Bytes>,
) -> Result<Option<serde_json::Value>, SyncError> {
    match value {
        Value::Binary(payload) => {
            paths.push(path.clone());
            payloads.push(payload.clone());
            Ok(None)
        }
        Value::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match extract(item, &path.child(i), paths, payloads)? {
                    Some(json) => out.push(json),
                    // Keep the slot so sibling indices survive extraction.
                    None => out.push(serde_json::Value::Null),
                }
            }
            Ok(Some(serde_json::Value::Array(out)))
        }
        Value::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if let Some(json) = extract(v, &path.child(k.as_str()), paths, payloads)? {
                    out.insert(k.clone(), json);
                }
            }
            Ok(Some(serde_json::Value::Object(out)))
        }
        scalar => value::to_json(scalar).map(Some),
    }
}

/// Reinsert binary payloads into a structured tree at their declared paths,
/// in list order, yielding the reassembled state map.
pub fn put_buffers(
    state: serde_json::Value,
    paths: &[BufferPath],
    payloads: Vec<Bytes>,
) -> Result<BTreeMap<String, Value>, SyncError> {
    if paths.len() != payloads.len() {
        return Err(SyncError::BufferCount {
            expected: paths.len(),
            got: payloads.len(),
        });
    }
    let mut root = match value::from_json(state) {
        Value::Map(map) => Value::Map(map),
        other => {
            return Err(SyncError::Decode {
                msg: format!("state root must be a mapping, got {other:?}"),
            })
        }
    };
    for (path, payload) in paths.iter().zip(payloads) {
        insert_at(&mut root, path, payload)?;
    }
    match root {
        Value::Map(map) => Ok(map),
        _ => unreachable!("root container cannot change shape"),
    }
}

fn insert_at(root: &mut Value, path: &BufferPath, payload: Bytes) -> Result<(), SyncError> {
    let bad = |msg: &str| {
        SyncError::Proto(ProtoError::BadPath {
            path: path.to_string(),
            msg: msg.to_string(),
        })
    };
    let (last, init) = path
        .segments()
        .split_last()
        .ok_or_else(|| bad("empty path"))?;
    let mut cursor = root;
    for seg in init {
        cursor = match (cursor, seg) {
            (Value::Map(map), PathSeg::Key(key)) => {
                map.get_mut(key).ok_or_else(|| bad("missing key"))?
            }
            (Value::Seq(items), PathSeg::Index(i)) => {
                items.get_mut(*i).ok_or_else(|| bad("index out of bounds"))?
            }
            _ => return Err(bad("segment does not match container shape")),
        };
    }
    match (cursor, last) {
        (Value::Map(map), PathSeg::Key(key)) => {
            map.insert(key.clone(), Value::Binary(payload));
            Ok(())
        }
        (Value::Seq(items), PathSeg::Index(i)) => {
            let slot = items.get_mut(*i).ok_or_else(|| bad("index out of bounds"))?;
            *slot = Value::Binary(payload);
            Ok(())
        }
        _ => Err(bad("segment does not match container shape")),
    }
}
