//! Reference tokens embedding one replica's identity inside another's state.

use crate::id::ReplicaId;

/// Prefix marking a string as a replica reference token.
pub const REF_PREFIX: &str = "ref://";

/// Render a replica id as a reference token.
pub fn format_ref(id: &ReplicaId) -> String {
    format!("{REF_PREFIX}{id}")
}

/// Parse a reference token, returning the embedded replica id.
///
/// Recognition is by prefix match only; any string not starting with
/// [`REF_PREFIX`] (or carrying an empty id) is an opaque scalar and yields
/// `None`.
pub fn parse_ref(s: &str) -> Option<ReplicaId> {
    match s.strip_prefix(REF_PREFIX) {
        Some("") | None => None,
        Some(id) => Some(ReplicaId::from(id)),
    }
}
