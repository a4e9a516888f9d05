//! Error types for the wire protocol.

use thiserror::Error;

/// Errors that can occur while parsing or building wire messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The message carried a method tag this protocol does not define.
    #[error("unknown method tag: {method}")]
    UnknownMethod {
        /// The unrecognized method tag.
        method: String,
    },

    /// The message was structurally invalid for its method tag.
    #[error("malformed message: {msg}")]
    MalformedMessage {
        /// Description of the structural problem.
        msg: String,
    },

    /// A buffer path did not address a valid location in the state tree.
    #[error("invalid buffer path `{path}`: {msg}")]
    BadPath {
        /// The offending path, rendered as `a.0.b`.
        path: String,
        /// Description of why the path could not be followed.
        msg: String,
    },
}
