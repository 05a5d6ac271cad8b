//! # nettable
//!
//! A replicated table of named, typed values shared between one server
//! and many clients.
//!
//! ## Overview
//!
//! Every node holds a full copy of the table. Local writes apply
//! immediately and propagate on a periodic flush; concurrent writes to
//! one entry are arbitrated by a 16-bit circular sequence number, with
//! the server breaking remaining ties. Two wire revisions are spoken,
//! 2.0 and 3.0, negotiated per connection; 3.0 adds entry flags,
//! deletes, raw values and client identity.
//!
//! - **Entry**: a named, typed, versioned value. Names are free-form
//!   strings, `/`-separated by convention.
//! - **Server**: assigns entry ids and rebroadcasts every accepted
//!   change to all other clients.
//! - **Client**: dials the server, reconciles its table during the
//!   handshake, and reconnects forever after any disconnect.
//! - **Persistent entries**: flagged entries the server saves to a text
//!   file and restores on startup.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nettable::{Instance, InstanceConfig, Value};
//!
//! async fn example() {
//!     let server = Instance::server(InstanceConfig::default());
//!     server.start_server("0.0.0.0:1735").await.unwrap();
//!
//!     let client = Instance::client(InstanceConfig {
//!         identity: "dashboard".into(),
//!         ..InstanceConfig::default()
//!     });
//!     client.start_client(&["127.0.0.1:1735"]).unwrap();
//!
//!     client.set_value("/speed", Value::Double(3.5)).unwrap();
//!     client.flush();
//! }
//! ```
//!
//! ## Re-exports
//!
//! The component crates are re-exported for direct access:
//!
//! - `nettable::core` - values, entries, sequence numbers, notifier
//! - `nettable::wire` - the binary wire format
//! - `nettable::store` - the entry table and persistence
//! - `nettable::net` - transports, handshakes and the dispatcher

pub mod error;
pub mod instance;

// Re-export component crates
pub use nettable_core as core;
pub use nettable_net as net;
pub use nettable_store as store;
pub use nettable_wire as wire;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use instance::{Instance, InstanceConfig};

// Re-export commonly used core types
pub use nettable_core::{
    notify_flags, ConnectionInfo, EntryFlags, EntryInfo, EntryNotification, ListenerId, Value,
    ValueType,
};
