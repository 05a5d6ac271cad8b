//! # nettable core
//!
//! Pure primitives for the nettable protocol: typed values, replicated
//! entries, circular sequence numbers, and the asynchronous notifier.
//!
//! This crate contains no networking and no storage. It is the shared
//! vocabulary the other crates build on.
//!
//! ## Key Types
//!
//! - [`Value`] - A typed, immutable value replicated between peers
//! - [`Entry`] - A named, versioned value with flags
//! - [`SeqNum`] - 16-bit circular version counter
//! - [`ConnectionInfo`] - Read-only snapshot of a peer session
//! - [`Notifier`] - Asynchronous fan-out of entry and connection events

pub mod connection_info;
pub mod entry;
pub mod notifier;
pub mod value;

pub use connection_info::ConnectionInfo;
pub use entry::{Entry, EntryFlags, EntryInfo, SeqNum, UNASSIGNED_ID};
pub use notifier::{
    notify_flags, ConnectionCallback, ConnectionNotification, EntryCallback, EntryNotification,
    ListenerId, Notifier,
};
pub use value::{Value, ValueType};
