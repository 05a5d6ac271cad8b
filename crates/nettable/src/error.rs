//! Error type for the top-level API.

use thiserror::Error;

use nettable_store::{PersistError, StoreError};

/// Errors that can occur through the [`crate::Instance`] API.
#[derive(Debug, Error)]
pub enum Error {
    /// Local table operation failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Persistence file could not be read or written.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Networking failure surfaced through the API.
    #[error("network error: {0}")]
    Net(#[from] nettable_net::NetError),

    /// The instance is already running or already stopped.
    #[error("invalid instance state: {0}")]
    InvalidState(&'static str),
}

/// Result type for Instance operations.
pub type Result<T> = std::result::Result<T, Error>;
