#![forbid(unsafe_code)]
//! Error types for the freespace engine.
//!
//! # Error Taxonomy
//!
//! The engine distinguishes two failure classes:
//!
//! | Class | Mechanism | Examples |
//! |-------|-----------|----------|
//! | Structural invariant violation | panic | overlapping range add, destroying a non-empty tree, swap into a non-empty tree, removing an absent deadlist key |
//! | Store / recoverable | `FspError` | unknown object id, wrong object kind, duplicate bucket key |
//!
//! Structural violations indicate caller bugs or in-memory corruption and are
//! never recovered, so they abort rather than propagate. Everything that can
//! legitimately fail at the persisted-store boundary surfaces as an
//! [`FspError`] and travels up with `?`; callers on a committing path treat
//! those as fatal too, but test stores and embedders get a typed error to
//! inspect.
//!
//! `fsp-error` intentionally does not depend on `fsp-types`: object ids and
//! generation keys appear here as raw `u64`s so the error crate sits at the
//! bottom of the dependency graph.

use thiserror::Error;

/// Unified error type for freespace store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FspError {
    /// The store has no object with this id.
    #[error("unknown object {object}")]
    UnknownObject { object: u64 },

    /// The object exists but is not of the kind the operation requires.
    #[error("object {object} is not a {expected}")]
    WrongObjectKind {
        object: u64,
        expected: &'static str,
    },

    /// A bucket map already holds this key.
    #[error("key {key} already present in object {object}")]
    KeyExists { object: u64, key: u64 },

    /// A bucket map has no entry at this key.
    #[error("key {key} not found in object {object}")]
    KeyNotFound { object: u64, key: u64 },

    /// The store rejected the operation for a backend-specific reason.
    #[error("store failure: {0}")]
    Store(String),
}

/// Result alias using `FspError`.
pub type Result<T> = std::result::Result<T, FspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = FspError::UnknownObject { object: 42 };
        assert_eq!(err.to_string(), "unknown object 42");

        let kind = FspError::WrongObjectKind {
            object: 7,
            expected: "bucket map",
        };
        assert_eq!(kind.to_string(), "object 7 is not a bucket map");

        let dup = FspError::KeyExists { object: 3, key: 100 };
        assert_eq!(dup.to_string(), "key 100 already present in object 3");

        let missing = FspError::KeyNotFound { object: 3, key: 100 };
        assert_eq!(missing.to_string(), "key 100 not found in object 3");

        let store = FspError::Store("disk on fire".into());
        assert_eq!(store.to_string(), "store failure: disk on fire");
    }
}
