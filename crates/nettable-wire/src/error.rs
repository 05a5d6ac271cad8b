//! Error types for the wire format.

use thiserror::Error;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// Value kind cannot be encoded at any revision (e.g. unassigned).
    #[error("unrecognized type")]
    UnsupportedType,

    /// Value or message kind not representable at this revision.
    #[error("{what} not supported in protocol < 3.0")]
    UnsupportedInProtocol { what: &'static str },

    /// String or array exceeds the revision's size bound.
    #[error("{what} too large to encode ({len} > {max})")]
    TooBig {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// Stream ended in the middle of a field.
    #[error("truncated input")]
    Truncated,

    /// Malformed LEB128 length prefix.
    #[error("malformed LEB128 value")]
    BadLeb128,

    /// Unknown value type tag on the wire.
    #[error("unknown value type tag 0x{0:02x}")]
    UnknownTypeTag(u8),

    /// Unknown message type tag on the wire.
    #[error("unknown message type tag 0x{0:02x}")]
    UnknownMessageTag(u8),

    /// Clear-all message carried the wrong magic value.
    #[error("clear-all message with bad magic 0x{0:08x}")]
    BadMagic(u32),

    /// String field was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    BadUtf8,

    /// Entry update at revision 2.0 referenced an entry whose type is
    /// unknown, so the value cannot be decoded.
    #[error("unknown entry type for id {0}")]
    UnknownEntryType(u32),

    /// Underlying stream error.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
