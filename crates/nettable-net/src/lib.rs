//! # nettable net
//!
//! Everything between the entry table and the socket: transport
//! abstractions, the hello/initial-sync handshake, per-connection
//! read/write tasks with outbound coalescing, and the dispatcher that
//! owns them all.
//!
//! A node runs one [`Dispatcher`] in either server or client role. The
//! server accepts peers through an [`Acceptor`]; the client dials
//! [`Connector`]s round-robin and reconnects forever.

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod transport;

pub use connection::{ConnState, Connection};
pub use dispatcher::Dispatcher;
pub use error::{NetError, Result};
pub use handshake::{ClientHandshake, Handshake, ServerHandshake};
pub use transport::{Acceptor, Connector, PeerStream, TcpAcceptor, TcpConnector};
