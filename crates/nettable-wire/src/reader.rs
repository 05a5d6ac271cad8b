//! Pull decoder over a connection's byte stream.

use bytes::Bytes;
use nettable_core::{Value, ValueType};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::encoder::type_from_tag;
use crate::error::{Result, WireError};
use crate::PROTO_REV_3;

/// Revision-aware pull decoder.
///
/// Reads exactly the bytes each field needs from the underlying stream.
/// Every failure is typed; the caller must treat any error as "this
/// stream can no longer be framed" and drop the connection.
pub struct WireReader<R> {
    inner: R,
    proto_rev: u32,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    /// Wrap a stream, decoding at the given protocol revision.
    pub fn new(inner: R, proto_rev: u32) -> Self {
        Self { inner, proto_rev }
    }

    /// The revision currently decoded against.
    pub fn proto_rev(&self) -> u32 {
        self.proto_rev
    }

    /// Change the revision (used after handshake negotiation).
    pub fn set_proto_rev(&mut self, proto_rev: u32) {
        self.proto_rev = proto_rev;
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    pub async fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    pub async fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await?;
        Ok(f64::from_be_bytes(buf))
    }

    /// Unsigned LEB128, at most 64 bits.
    pub async fn read_uleb128(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(WireError::BadLeb128);
            }
            let byte = self.read_u8().await?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Length-prefixed UTF-8 string, framed per the current revision.
    pub async fn read_string(&mut self) -> Result<String> {
        let len = if self.proto_rev < PROTO_REV_3 {
            usize::from(self.read_u16().await?)
        } else {
            self.read_uleb128().await? as usize
        };
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        String::from_utf8(buf).map_err(|_| WireError::BadUtf8)
    }

    /// LEB128-prefixed byte blob.
    pub async fn read_raw(&mut self) -> Result<Bytes> {
        let len = self.read_uleb128().await? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// A value type tag.
    pub async fn read_type(&mut self) -> Result<ValueType> {
        let tag = self.read_u8().await?;
        type_from_tag(tag).ok_or(WireError::UnknownTypeTag(tag))
    }

    /// A value body of the given type (no leading tag).
    pub async fn read_value(&mut self, ty: ValueType) -> Result<Value> {
        match ty {
            ValueType::Unassigned => Err(WireError::UnsupportedType),
            ValueType::Boolean => Ok(Value::Boolean(self.read_u8().await? != 0)),
            ValueType::Double => Ok(Value::Double(self.read_f64().await?)),
            ValueType::String => Ok(Value::Str(self.read_string().await?)),
            ValueType::Raw => Ok(Value::Raw(self.read_raw().await?)),
            ValueType::Rpc => Ok(Value::Rpc(self.read_raw().await?)),
            ValueType::BooleanArray => {
                let len = usize::from(self.read_u8().await?);
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_u8().await? != 0);
                }
                Ok(Value::BooleanArray(items))
            }
            ValueType::DoubleArray => {
                let len = usize::from(self.read_u8().await?);
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_f64().await?);
                }
                Ok(Value::DoubleArray(items))
            }
            ValueType::StringArray => {
                let len = usize::from(self.read_u8().await?);
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_string().await?);
                }
                Ok(Value::StringArray(items))
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Truncated),
            Err(e) => Err(WireError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTO_REV_2;

    fn reader(bytes: &[u8], proto_rev: u32) -> WireReader<&[u8]> {
        WireReader::new(bytes, proto_rev)
    }

    #[tokio::test]
    async fn test_read_integers() {
        let mut r = reader(&[0x05, 0x45, 0x67, 0x12, 0x34, 0x56, 0x78], PROTO_REV_3);
        assert_eq!(r.read_u8().await.unwrap(), 5);
        assert_eq!(r.read_u16().await.unwrap(), 0x4567);
        assert_eq!(r.read_u32().await.unwrap(), 0x12345678);
    }

    #[tokio::test]
    async fn test_read_truncated() {
        let mut r = reader(&[0x01], PROTO_REV_3);
        assert!(matches!(r.read_u32().await, Err(WireError::Truncated)));
    }

    #[tokio::test]
    async fn test_read_uleb128() {
        let mut r = reader(&[0x00, 0x7f, 0x80, 0x01], PROTO_REV_3);
        assert_eq!(r.read_uleb128().await.unwrap(), 0);
        assert_eq!(r.read_uleb128().await.unwrap(), 0x7f);
        assert_eq!(r.read_uleb128().await.unwrap(), 0x80);
    }

    #[tokio::test]
    async fn test_read_uleb128_overlong() {
        let mut r = reader(&[0xff; 11], PROTO_REV_3);
        assert!(matches!(r.read_uleb128().await, Err(WireError::BadLeb128)));
    }

    #[tokio::test]
    async fn test_read_string_both_revisions() {
        let mut r = reader(&[0x00, 0x05, b'h', b'e', b'l', b'l', b'o'], PROTO_REV_2);
        assert_eq!(r.read_string().await.unwrap(), "hello");

        let mut r = reader(&[0x05, b'h', b'e', b'l', b'l', b'o'], PROTO_REV_3);
        assert_eq!(r.read_string().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_read_string_bad_utf8() {
        let mut r = reader(&[0x02, 0xff, 0xfe], PROTO_REV_3);
        assert!(matches!(r.read_string().await, Err(WireError::BadUtf8)));
    }

    #[tokio::test]
    async fn test_read_unknown_type_tag() {
        let mut r = reader(&[0x42], PROTO_REV_3);
        assert!(matches!(
            r.read_type().await,
            Err(WireError::UnknownTypeTag(0x42))
        ));
    }

    #[tokio::test]
    async fn test_read_boolean_array_value() {
        let mut r = reader(&[0x03, 0x00, 0x01, 0x00], PROTO_REV_3);
        assert_eq!(
            r.read_value(ValueType::BooleanArray).await.unwrap(),
            Value::BooleanArray(vec![false, true, false])
        );
    }
}
