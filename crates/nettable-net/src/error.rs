//! Error types for the networking layer.

use thiserror::Error;

/// Errors raised by transports, handshakes and connection tasks.
#[derive(Debug, Error)]
pub enum NetError {
    /// Wire-level encode or decode failure. Any decode failure is fatal
    /// to the connection.
    #[error(transparent)]
    Wire(#[from] nettable_wire::WireError),

    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection or the stream ended.
    #[error("connection closed")]
    Closed,

    /// The peer violated the handshake sequence.
    #[error("handshake protocol violation: {0}")]
    Handshake(&'static str),

    /// The server rejected our protocol revision and told us which one
    /// it speaks.
    #[error("server only supports protocol revision {0:#06x}")]
    UnsupportedRevision(u32),

    /// The component is shutting down.
    #[error("shutting down")]
    Shutdown,

    #[error("connect timed out")]
    ConnectTimeout,
}

/// Result type for networking operations.
pub type Result<T, E = NetError> = std::result::Result<T, E>;
