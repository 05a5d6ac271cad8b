//! Revision-aware encoder for wire primitives and values.

use bytes::{BufMut, Bytes, BytesMut};
use nettable_core::{Value, ValueType};

use crate::error::{Result, WireError};
use crate::PROTO_REV_3;

/// Largest element count an array value may carry on the wire.
pub const MAX_ARRAY_LEN: usize = 255;

/// Largest string byte length representable with a 2.0 length prefix.
pub const MAX_STRING_LEN_V2: usize = 0xffff;

pub(crate) fn type_tag(ty: ValueType) -> Option<u8> {
    match ty {
        ValueType::Unassigned => None,
        ValueType::Boolean => Some(0x00),
        ValueType::Double => Some(0x01),
        ValueType::String => Some(0x02),
        ValueType::Raw => Some(0x03),
        ValueType::BooleanArray => Some(0x10),
        ValueType::DoubleArray => Some(0x11),
        ValueType::StringArray => Some(0x12),
        ValueType::Rpc => Some(0x20),
    }
}

pub(crate) fn type_from_tag(tag: u8) -> Option<ValueType> {
    match tag {
        0x00 => Some(ValueType::Boolean),
        0x01 => Some(ValueType::Double),
        0x02 => Some(ValueType::String),
        0x03 => Some(ValueType::Raw),
        0x10 => Some(ValueType::BooleanArray),
        0x11 => Some(ValueType::DoubleArray),
        0x12 => Some(ValueType::StringArray),
        0x20 => Some(ValueType::Rpc),
        _ => None,
    }
}

/// Buffer-backed wire encoder.
///
/// Integer primitives are big-endian and infallible. Strings, type tags
/// and values depend on the protocol revision and return a [`WireError`]
/// for anything the revision cannot represent; a failed call leaves the
/// buffer exactly as it was.
pub struct WireEncoder {
    proto_rev: u32,
    buf: BytesMut,
}

impl WireEncoder {
    /// Create an empty encoder for the given protocol revision.
    pub fn new(proto_rev: u32) -> Self {
        Self {
            proto_rev,
            buf: BytesMut::new(),
        }
    }

    /// The revision this encoder targets.
    pub fn proto_rev(&self) -> u32 {
        self.proto_rev
    }

    /// Change the target revision (used after handshake negotiation).
    pub fn set_proto_rev(&mut self, proto_rev: u32) {
        self.proto_rev = proto_rev;
    }

    /// Discard any buffered output.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// The encoded bytes so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Number of encoded bytes so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes, leaving the encoder empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Roll buffered output back to an earlier length, discarding a
    /// partially encoded message.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    /// Unsigned LEB128.
    pub fn write_uleb128(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.put_u8(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Length-prefixed UTF-8 string.
    ///
    /// Revision 2.0 uses a 16-bit prefix and rejects longer strings;
    /// revision 3.0 uses LEB128 and is unbounded.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        if self.proto_rev < PROTO_REV_3 {
            if bytes.len() > MAX_STRING_LEN_V2 {
                return Err(WireError::TooBig {
                    what: "string",
                    len: bytes.len(),
                    max: MAX_STRING_LEN_V2,
                });
            }
            self.write_u16(bytes.len() as u16);
        } else {
            self.write_uleb128(bytes.len() as u64);
        }
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// LEB128-prefixed byte blob (3.0 framing, also used for RPC bodies).
    pub fn write_raw(&mut self, value: &[u8]) {
        self.write_uleb128(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// A value type tag.
    pub fn write_type(&mut self, ty: ValueType) -> Result<()> {
        if self.proto_rev < PROTO_REV_3 {
            match ty {
                ValueType::Raw => {
                    return Err(WireError::UnsupportedInProtocol { what: "raw type" })
                }
                ValueType::Rpc => {
                    return Err(WireError::UnsupportedInProtocol { what: "RPC type" })
                }
                _ => {}
            }
        }
        let tag = type_tag(ty).ok_or(WireError::UnsupportedType)?;
        self.write_u8(tag);
        Ok(())
    }

    /// A value body (no leading type tag).
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Boolean(b) => self.write_u8(u8::from(*b)),
            Value::Double(d) => self.write_f64(*d),
            Value::Str(s) => self.write_string(s)?,
            Value::Raw(bytes) | Value::Rpc(bytes) => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::UnsupportedInProtocol { what: "raw value" });
                }
                self.write_raw(bytes);
            }
            Value::BooleanArray(items) => {
                self.write_array_len(items.len())?;
                for b in items {
                    self.write_u8(u8::from(*b));
                }
            }
            Value::DoubleArray(items) => {
                self.write_array_len(items.len())?;
                for d in items {
                    self.write_f64(*d);
                }
            }
            Value::StringArray(items) => {
                self.write_array_len(items.len())?;
                // checkpoint so a too-long element can roll back cleanly
                let mark = self.buf.len();
                for s in items {
                    if let Err(e) = self.write_string(s) {
                        self.buf.truncate(mark - 1);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_array_len(&mut self, len: usize) -> Result<()> {
        if len > MAX_ARRAY_LEN {
            return Err(WireError::TooBig {
                what: "array",
                len,
                max: MAX_ARRAY_LEN,
            });
        }
        self.write_u8(len as u8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTO_REV_2;

    #[test]
    fn test_write_integers_big_endian() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        e.write_u8(5);
        e.write_u16(0x4567);
        e.write_u32(0x12345678);
        assert_eq!(
            e.buffer(),
            &[0x05, 0x45, 0x67, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn test_write_f64() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        e.write_f64(2.3e5);
        e.write_f64(f64::INFINITY);
        assert_eq!(
            e.buffer(),
            &[
                0x41, 0x0c, 0x13, 0x80, 0x00, 0x00, 0x00, 0x00, //
                0x7f, 0xf0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn test_write_uleb128() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        e.write_uleb128(0);
        e.write_uleb128(0x7f);
        e.write_uleb128(0x80);
        assert_eq!(e.buffer(), &[0x00, 0x7f, 0x80, 0x01]);
    }

    #[test]
    fn test_write_type_tags() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        for ty in [
            ValueType::Boolean,
            ValueType::Double,
            ValueType::String,
            ValueType::Raw,
            ValueType::BooleanArray,
            ValueType::DoubleArray,
            ValueType::StringArray,
            ValueType::Rpc,
        ] {
            e.write_type(ty).unwrap();
        }
        assert_eq!(
            e.buffer(),
            &[0x00, 0x01, 0x02, 0x03, 0x10, 0x11, 0x12, 0x20]
        );
    }

    #[test]
    fn test_write_type_errors_v2() {
        let mut e = WireEncoder::new(PROTO_REV_2);
        assert!(matches!(
            e.write_type(ValueType::Unassigned),
            Err(WireError::UnsupportedType)
        ));
        assert!(matches!(
            e.write_type(ValueType::Raw),
            Err(WireError::UnsupportedInProtocol { .. })
        ));
        assert!(matches!(
            e.write_type(ValueType::Rpc),
            Err(WireError::UnsupportedInProtocol { .. })
        ));
        assert!(e.is_empty());
    }

    #[test]
    fn test_write_string_v2() {
        let mut e = WireEncoder::new(PROTO_REV_2);
        e.write_string("hello").unwrap();
        assert_eq!(e.buffer(), &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_write_string_v2_big_is_exactly_bounded() {
        // 65535 bytes fits with the 0xffff prefix, 65536 does not
        let mut e = WireEncoder::new(PROTO_REV_2);
        let fits = "*".repeat(65535);
        e.write_string(&fits).unwrap();
        assert_eq!(e.len(), 65537);
        assert_eq!(&e.buffer()[..2], &[0xff, 0xff]);

        e.reset();
        let too_big = "*".repeat(65536);
        assert!(matches!(
            e.write_string(&too_big),
            Err(WireError::TooBig { .. })
        ));
        assert!(e.is_empty());
    }

    #[test]
    fn test_write_string_v3_leb128() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        e.write_string("hello").unwrap();
        assert_eq!(e.buffer(), &[0x05, b'h', b'e', b'l', b'l', b'o']);

        e.reset();
        let long = format!("{}x", "*".repeat(127));
        e.write_string(&long).unwrap();
        assert_eq!(e.len(), 130);
        assert_eq!(&e.buffer()[..2], &[0x80, 0x01]);

        e.reset();
        let big = format!("{}xxx", "*".repeat(65534));
        e.write_string(&big).unwrap();
        assert_eq!(e.len(), 65540);
        assert_eq!(&e.buffer()[..3], &[0x81, 0x80, 0x04]);
    }

    #[test]
    fn test_write_boolean_value() {
        let mut e = WireEncoder::new(PROTO_REV_2);
        e.write_value(&Value::Boolean(true)).unwrap();
        e.write_value(&Value::Boolean(false)).unwrap();
        assert_eq!(e.buffer(), &[0x01, 0x00]);
    }

    #[test]
    fn test_write_double_value() {
        let mut e = WireEncoder::new(PROTO_REV_2);
        e.write_value(&Value::Double(1.0)).unwrap();
        assert_eq!(
            e.buffer(),
            &[0x3f, 0xf0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_write_raw_value_by_revision() {
        let raw = Value::Raw(bytes::Bytes::from_static(b"hello"));
        let mut e = WireEncoder::new(PROTO_REV_2);
        assert!(matches!(
            e.write_value(&raw),
            Err(WireError::UnsupportedInProtocol { .. })
        ));
        assert!(e.is_empty());

        let mut e = WireEncoder::new(PROTO_REV_3);
        e.write_value(&raw).unwrap();
        assert_eq!(e.buffer(), &[0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_write_string_array_value() {
        let mut e = WireEncoder::new(PROTO_REV_2);
        e.write_value(&Value::StringArray(vec!["hello".into(), "goodbye".into()]))
            .unwrap();
        assert_eq!(
            e.buffer(),
            &[
                0x02, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', //
                0x00, 0x07, b'g', b'o', b'o', b'd', b'b', b'y', b'e',
            ]
        );
    }

    #[test]
    fn test_write_array_too_long() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        assert!(matches!(
            e.write_value(&Value::BooleanArray(vec![false; 256])),
            Err(WireError::TooBig { .. })
        ));
        assert!(e.is_empty());
    }

    #[test]
    fn test_boolean_array_value() {
        let mut e = WireEncoder::new(PROTO_REV_3);
        e.write_value(&Value::BooleanArray(vec![false, true, false]))
            .unwrap();
        assert_eq!(e.buffer(), &[0x03, 0x00, 0x01, 0x00]);
    }
}
