//! # nettable store
//!
//! The authoritative entry table. [`Storage`] owns every live entry,
//! arbitrates concurrent local and remote updates by circular sequence
//! number, decides what must be echoed or broadcast, produces the
//! initial-sync snapshot, and persists entries flagged persistent to a
//! human-readable text file.

pub mod error;
pub mod persist;
pub mod storage;

pub use error::{PersistError, Result, StoreError};
pub use storage::{ConnectionId, ConnectionToken, OutgoingFn, Storage};
