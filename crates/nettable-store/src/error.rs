//! Error types for the store.

use nettable_core::ValueType;
use thiserror::Error;

/// Errors raised by local storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An existing entry cannot change type in place.
    #[error("type mismatch for '{name}': entry is {existing}, new value is {new}")]
    TypeMismatch {
        name: String,
        existing: ValueType,
        new: ValueType,
    },

    /// Entry names must be non-empty.
    #[error("entry name is empty")]
    EmptyName,
}

/// Errors raised while saving or loading the persistence file.
///
/// Only whole-file failures are errors; individually malformed lines
/// are reported as warnings and skipped.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistent file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing or unrecognized persistent file header")]
    BadHeader,
}

/// Result type for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
