//! Typed error kinds for the storage core.
//!
//! Internal plumbing uses `eyre` for context-rich propagation. The kinds
//! below are the stable surface that `transact` and `open` report; callers
//! match on them with `err.downcast_ref::<ZatError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZatError {
    #[error("corrupt database: {reason}")]
    CorruptDatabase { reason: String },

    #[error("unknown attribute {ident}")]
    UnknownAttribute { ident: String },

    #[error("type mismatch on {ident}: expected {expected}, got {actual}")]
    TypeMismatch {
        ident: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unique conflict on {ident}: value already belongs to entity {holder}")]
    UniqueValueConflict { ident: String, holder: u64 },

    #[error("transaction exceeds the tempid limit of {limit}")]
    TempidOverflow { limit: usize },

    #[error("transaction exceeds the datom limit of {limit}")]
    DatomOverflow { limit: usize },

    #[error("encoded key of {len} bytes exceeds the limit of {limit}")]
    ValueTooLarge { len: usize, limit: usize },

    #[error("all {limit} reader slots are in use")]
    ReadersExhausted { limit: usize },
}

/// Extracts the typed kind from an `eyre` chain, if one is present.
pub fn error_kind(err: &eyre::Report) -> Option<&ZatError> {
    err.downcast_ref::<ZatError>()
}
