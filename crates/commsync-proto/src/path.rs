//! Traversal paths addressing binary leaves inside a structured state tree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a buffer path: a mapping key or a sequence index.
///
/// Serialized untagged, so a path renders as a plain JSON array like
/// `["image", 0, "data"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSeg {
    /// Descend into a mapping by key.
    Key(String),
    /// Descend into a sequence by index.
    Index(usize),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(k) => f.write_str(k),
            PathSeg::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PathSeg {
    fn from(key: &str) -> Self {
        PathSeg::Key(key.to_string())
    }
}

impl From<usize> for PathSeg {
    fn from(index: usize) -> Self {
        PathSeg::Index(index)
    }
}

/// Ordered traversal path from the payload root to a binary leaf.
///
/// Paths are recorded in a deterministic depth-first order during buffer
/// extraction and must round-trip through removal and reinsertion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferPath(pub Vec<PathSeg>);

impl BufferPath {
    /// The empty path, addressing the payload root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from its segments.
    pub fn from_segments(segments: Vec<PathSeg>) -> Self {
        Self(segments)
    }

    /// This path extended with one more segment.
    pub fn child(&self, seg: impl Into<PathSeg>) -> Self {
        let mut segments = self.0.clone();
        segments.push(seg.into());
        Self(segments)
    }

    /// The segments of this path, root first.
    pub fn segments(&self) -> &[PathSeg] {
        &self.0
    }

    /// Whether this path addresses the payload root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BufferPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}
