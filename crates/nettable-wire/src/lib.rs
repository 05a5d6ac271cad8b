//! # nettable wire
//!
//! The versioned binary wire format: primitive encoders/decoders and the
//! closed protocol [`Message`] vocabulary.
//!
//! Two protocol revisions are in play, [`PROTO_REV_2`] (0x0200) and
//! [`PROTO_REV_3`] (0x0300). The revision is negotiated once per
//! connection and changes string framing, flag bytes, and which message
//! and value kinds are representable.
//!
//! ## Error model
//!
//! Every fallible encode call returns a [`WireError`] immediately; a
//! failed encode aborts only that message. Any decode failure means the
//! rest of the stream cannot be trusted and the connection must be
//! dropped.

pub mod encoder;
pub mod error;
pub mod message;
pub mod reader;

pub use encoder::WireEncoder;
pub use error::{Result, WireError};
pub use message::{Message, MessageType, CLEAR_ALL_MAGIC};
pub use reader::WireReader;

/// Wire revision 2.0: 16-bit string length prefixes, no Raw/Rpc values,
/// no entry flags on the wire.
pub const PROTO_REV_2: u32 = 0x0200;

/// Wire revision 3.0: LEB128 string framing, Raw/Rpc values, entry
/// flags, deletes, and RPC messages.
pub const PROTO_REV_3: u32 = 0x0300;
