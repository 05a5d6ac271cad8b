//! Read-only snapshots of peer sessions.

/// Immutable description of one peer connection, produced on demand and
/// never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Identity string the peer sent during the handshake.
    pub remote_id: String,
    /// Peer IP address, as reported by the transport.
    pub remote_ip: String,
    /// Peer port.
    pub remote_port: u16,
    /// Milliseconds-since-epoch timestamp of the last received message.
    pub last_update: u64,
    /// The negotiated protocol revision, fixed for the connection's life.
    pub protocol_version: u32,
}
