//! The closed set of protocol messages.
//!
//! Each message is one byte of type tag followed by a type-specific
//! payload. Which messages exist, and their exact layout, depends on
//! the negotiated protocol revision.

use bytes::Bytes;
use nettable_core::{EntryFlags, SeqNum, Value, ValueType};
use tokio::io::AsyncRead;

use crate::encoder::WireEncoder;
use crate::error::{Result, WireError};
use crate::reader::WireReader;
use crate::PROTO_REV_3;

/// Magic value carried by `ClearAllEntries`, guarding against a stray
/// tag byte wiping the whole table.
pub const CLEAR_ALL_MAGIC: u32 = 0xd06c_b27a;

mod tag {
    pub const KEEP_ALIVE: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const PROTO_UNSUP: u8 = 0x02;
    pub const SERVER_HELLO_DONE: u8 = 0x03;
    pub const SERVER_HELLO: u8 = 0x04;
    pub const CLIENT_HELLO_DONE: u8 = 0x05;
    pub const ENTRY_ASSIGN: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
    pub const FLAGS_UPDATE: u8 = 0x12;
    pub const ENTRY_DELETE: u8 = 0x13;
    pub const CLEAR_ALL_ENTRIES: u8 = 0x14;
    pub const EXECUTE_RPC: u8 = 0x20;
    pub const RPC_RESPONSE: u8 = 0x21;
}

/// Discriminator for [`Message`], used by handshake logic and the
/// coalescing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    KeepAlive,
    ClientHello,
    ProtoUnsup,
    ServerHelloDone,
    ServerHello,
    ClientHelloDone,
    EntryAssign,
    EntryUpdate,
    FlagsUpdate,
    EntryDelete,
    ClearAllEntries,
    ExecuteRpc,
    RpcResponse,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Empty message keeping an idle link open.
    KeepAlive,
    /// First message from a client: requested revision plus (3.0)
    /// identity.
    ClientHello { proto_rev: u32, identity: String },
    /// Server rejection of an unsupported revision, carrying the
    /// revision it does support.
    ProtoUnsup { proto_rev: u32 },
    /// Terminates the server's initial snapshot.
    ServerHelloDone,
    /// 3.0 server greeting. Flag bit 0 means this client identity has
    /// connected before.
    ServerHello { flags: u8, identity: String },
    /// Terminates the client's reconciliation batch (3.0).
    ClientHelloDone,
    /// Creates or re-synchronizes one entry.
    EntryAssign {
        name: String,
        id: u32,
        seq_num: SeqNum,
        flags: EntryFlags,
        value: Value,
    },
    /// Updates the value of an already-assigned entry.
    EntryUpdate { id: u32, seq_num: SeqNum, value: Value },
    /// Updates only the flags of an entry (3.0).
    FlagsUpdate { id: u32, flags: EntryFlags },
    /// Deletes one entry (3.0).
    EntryDelete { id: u32 },
    /// Deletes every entry (3.0).
    ClearAllEntries,
    /// RPC invocation request (3.0).
    ExecuteRpc { id: u32, uid: u32, params: Bytes },
    /// RPC invocation result (3.0).
    RpcResponse { id: u32, uid: u32, results: Bytes },
}

impl Message {
    /// The message's discriminator.
    pub fn ty(&self) -> MessageType {
        match self {
            Message::KeepAlive => MessageType::KeepAlive,
            Message::ClientHello { .. } => MessageType::ClientHello,
            Message::ProtoUnsup { .. } => MessageType::ProtoUnsup,
            Message::ServerHelloDone => MessageType::ServerHelloDone,
            Message::ServerHello { .. } => MessageType::ServerHello,
            Message::ClientHelloDone => MessageType::ClientHelloDone,
            Message::EntryAssign { .. } => MessageType::EntryAssign,
            Message::EntryUpdate { .. } => MessageType::EntryUpdate,
            Message::FlagsUpdate { .. } => MessageType::FlagsUpdate,
            Message::EntryDelete { .. } => MessageType::EntryDelete,
            Message::ClearAllEntries => MessageType::ClearAllEntries,
            Message::ExecuteRpc { .. } => MessageType::ExecuteRpc,
            Message::RpcResponse { .. } => MessageType::RpcResponse,
        }
    }

    /// Type-test predicate used pervasively by the handshakes.
    pub fn is(&self, ty: MessageType) -> bool {
        self.ty() == ty
    }

    /// The entry id this message targets, for coalescing. `None` for
    /// messages not tied to a single entry.
    pub fn entry_id(&self) -> Option<u32> {
        match self {
            Message::EntryAssign { id, .. }
            | Message::EntryUpdate { id, .. }
            | Message::FlagsUpdate { id, .. }
            | Message::EntryDelete { id } => Some(*id),
            _ => None,
        }
    }

    /// Encode onto `enc` at its protocol revision.
    ///
    /// Messages that do not exist at the encoder's revision fail with
    /// [`WireError::UnsupportedInProtocol`]. On error the encoder may
    /// hold a partial message; callers roll back via
    /// [`WireEncoder::truncate`].
    pub fn encode(&self, enc: &mut WireEncoder) -> Result<()> {
        let v3 = enc.proto_rev() >= PROTO_REV_3;
        match self {
            Message::KeepAlive => enc.write_u8(tag::KEEP_ALIVE),
            Message::ClientHello {
                proto_rev,
                identity,
            } => {
                enc.write_u8(tag::CLIENT_HELLO);
                enc.write_u16(*proto_rev as u16);
                if v3 {
                    enc.write_string(identity)?;
                }
            }
            Message::ProtoUnsup { proto_rev } => {
                enc.write_u8(tag::PROTO_UNSUP);
                enc.write_u16(*proto_rev as u16);
            }
            Message::ServerHelloDone => enc.write_u8(tag::SERVER_HELLO_DONE),
            Message::ServerHello { flags, identity } => {
                require_v3(v3, "server hello message")?;
                enc.write_u8(tag::SERVER_HELLO);
                enc.write_u8(*flags);
                enc.write_string(identity)?;
            }
            Message::ClientHelloDone => {
                require_v3(v3, "client hello done message")?;
                enc.write_u8(tag::CLIENT_HELLO_DONE);
            }
            Message::EntryAssign {
                name,
                id,
                seq_num,
                flags,
                value,
            } => {
                enc.write_u8(tag::ENTRY_ASSIGN);
                enc.write_string(name)?;
                enc.write_type(value.ty())?;
                enc.write_u16(*id as u16);
                enc.write_u16(seq_num.value());
                if v3 {
                    enc.write_u8(flags.bits());
                }
                enc.write_value(value)?;
            }
            Message::EntryUpdate { id, seq_num, value } => {
                enc.write_u8(tag::ENTRY_UPDATE);
                enc.write_u16(*id as u16);
                enc.write_u16(seq_num.value());
                if v3 {
                    enc.write_type(value.ty())?;
                }
                enc.write_value(value)?;
            }
            Message::FlagsUpdate { id, flags } => {
                require_v3(v3, "flags update message")?;
                enc.write_u8(tag::FLAGS_UPDATE);
                enc.write_u16(*id as u16);
                enc.write_u8(flags.bits());
            }
            Message::EntryDelete { id } => {
                require_v3(v3, "entry delete message")?;
                enc.write_u8(tag::ENTRY_DELETE);
                enc.write_u16(*id as u16);
            }
            Message::ClearAllEntries => {
                require_v3(v3, "clear all entries message")?;
                enc.write_u8(tag::CLEAR_ALL_ENTRIES);
                enc.write_u32(CLEAR_ALL_MAGIC);
            }
            Message::ExecuteRpc { id, uid, params } => {
                require_v3(v3, "RPC message")?;
                enc.write_u8(tag::EXECUTE_RPC);
                enc.write_u16(*id as u16);
                enc.write_u16(*uid as u16);
                enc.write_raw(params);
            }
            Message::RpcResponse { id, uid, results } => {
                require_v3(v3, "RPC message")?;
                enc.write_u8(tag::RPC_RESPONSE);
                enc.write_u16(*id as u16);
                enc.write_u16(*uid as u16);
                enc.write_raw(results);
            }
        }
        Ok(())
    }

    /// Decode one message at the reader's protocol revision.
    ///
    /// `get_entry_type` resolves the value type of 2.0 `EntryUpdate`
    /// messages, which carry no type tag of their own.
    pub async fn decode<R, F>(reader: &mut WireReader<R>, get_entry_type: F) -> Result<Message>
    where
        R: AsyncRead + Unpin,
        F: Fn(u32) -> ValueType,
    {
        let v3 = reader.proto_rev() >= PROTO_REV_3;
        let msg_tag = reader.read_u8().await?;
        match msg_tag {
            tag::KEEP_ALIVE => Ok(Message::KeepAlive),
            tag::CLIENT_HELLO => {
                let proto_rev = u32::from(reader.read_u16().await?);
                let identity = if proto_rev >= PROTO_REV_3 {
                    reader.read_string().await?
                } else {
                    String::new()
                };
                Ok(Message::ClientHello {
                    proto_rev,
                    identity,
                })
            }
            tag::PROTO_UNSUP => Ok(Message::ProtoUnsup {
                proto_rev: u32::from(reader.read_u16().await?),
            }),
            tag::SERVER_HELLO_DONE => Ok(Message::ServerHelloDone),
            tag::SERVER_HELLO if v3 => Ok(Message::ServerHello {
                flags: reader.read_u8().await?,
                identity: reader.read_string().await?,
            }),
            tag::CLIENT_HELLO_DONE if v3 => Ok(Message::ClientHelloDone),
            tag::ENTRY_ASSIGN => {
                let name = reader.read_string().await?;
                let ty = reader.read_type().await?;
                let id = u32::from(reader.read_u16().await?);
                let seq_num = SeqNum::new(reader.read_u16().await?);
                let flags = if v3 {
                    EntryFlags::from_bits(reader.read_u8().await?)
                } else {
                    EntryFlags::NONE
                };
                let value = reader.read_value(ty).await?;
                Ok(Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    flags,
                    value,
                })
            }
            tag::ENTRY_UPDATE => {
                let id = u32::from(reader.read_u16().await?);
                let seq_num = SeqNum::new(reader.read_u16().await?);
                let ty = if v3 {
                    reader.read_type().await?
                } else {
                    match get_entry_type(id) {
                        ValueType::Unassigned => return Err(WireError::UnknownEntryType(id)),
                        ty => ty,
                    }
                };
                let value = reader.read_value(ty).await?;
                Ok(Message::EntryUpdate { id, seq_num, value })
            }
            tag::FLAGS_UPDATE if v3 => Ok(Message::FlagsUpdate {
                id: u32::from(reader.read_u16().await?),
                flags: EntryFlags::from_bits(reader.read_u8().await?),
            }),
            tag::ENTRY_DELETE if v3 => Ok(Message::EntryDelete {
                id: u32::from(reader.read_u16().await?),
            }),
            tag::CLEAR_ALL_ENTRIES if v3 => {
                let magic = reader.read_u32().await?;
                if magic != CLEAR_ALL_MAGIC {
                    return Err(WireError::BadMagic(magic));
                }
                Ok(Message::ClearAllEntries)
            }
            tag::EXECUTE_RPC if v3 => Ok(Message::ExecuteRpc {
                id: u32::from(reader.read_u16().await?),
                uid: u32::from(reader.read_u16().await?),
                params: reader.read_raw().await?,
            }),
            tag::RPC_RESPONSE if v3 => Ok(Message::RpcResponse {
                id: u32::from(reader.read_u16().await?),
                uid: u32::from(reader.read_u16().await?),
                results: reader.read_raw().await?,
            }),
            other => Err(WireError::UnknownMessageTag(other)),
        }
    }
}

fn require_v3(v3: bool, what: &'static str) -> Result<()> {
    if v3 {
        Ok(())
    } else {
        Err(WireError::UnsupportedInProtocol { what })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTO_REV_2;
    use nettable_core::UNASSIGNED_ID;

    async fn roundtrip(msg: &Message, proto_rev: u32) -> Message {
        let mut enc = WireEncoder::new(proto_rev);
        msg.encode(&mut enc).unwrap();
        let bytes = enc.take();
        let mut reader = WireReader::new(&bytes[..], proto_rev);
        let decoded = Message::decode(&mut reader, |_| ValueType::Double)
            .await
            .unwrap();
        decoded
    }

    fn assign(name: &str, id: u32, seq: u16, value: Value) -> Message {
        Message::EntryAssign {
            name: name.into(),
            id,
            seq_num: SeqNum::new(seq),
            flags: EntryFlags::PERSISTENT,
            value,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_handshake_messages_v3() {
        for msg in [
            Message::KeepAlive,
            Message::ClientHello {
                proto_rev: PROTO_REV_3,
                identity: "robot".into(),
            },
            Message::ProtoUnsup {
                proto_rev: PROTO_REV_3,
            },
            Message::ServerHello {
                flags: 0x01,
                identity: "server".into(),
            },
            Message::ServerHelloDone,
            Message::ClientHelloDone,
            Message::ClearAllEntries,
        ] {
            assert_eq!(roundtrip(&msg, PROTO_REV_3).await, msg);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_entry_messages_both_revisions() {
        for proto_rev in [PROTO_REV_2, PROTO_REV_3] {
            let msg = assign("/a/b", 3, 7, Value::Str("v".into()));
            let decoded = roundtrip(&msg, proto_rev).await;
            if proto_rev >= PROTO_REV_3 {
                assert_eq!(decoded, msg);
            } else {
                // flags byte is not on the 2.0 wire
                assert!(matches!(
                    decoded,
                    Message::EntryAssign { flags, .. } if flags == EntryFlags::NONE
                ));
            }

            let msg = Message::EntryUpdate {
                id: 3,
                seq_num: SeqNum::new(8),
                value: Value::Double(0.25),
            };
            assert_eq!(roundtrip(&msg, proto_rev).await, msg);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_v3_only_messages() {
        for msg in [
            Message::FlagsUpdate {
                id: 9,
                flags: EntryFlags::PERSISTENT,
            },
            Message::EntryDelete { id: 9 },
            Message::ExecuteRpc {
                id: 1,
                uid: 2,
                params: Bytes::from_static(b"\x01\x02"),
            },
            Message::RpcResponse {
                id: 1,
                uid: 2,
                results: Bytes::from_static(b"\x03"),
            },
        ] {
            assert_eq!(roundtrip(&msg, PROTO_REV_3).await, msg);

            let mut enc = WireEncoder::new(PROTO_REV_2);
            assert!(matches!(
                msg.encode(&mut enc),
                Err(WireError::UnsupportedInProtocol { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_client_hello_v2_has_no_identity() {
        let msg = Message::ClientHello {
            proto_rev: PROTO_REV_2,
            identity: String::new(),
        };
        let mut enc = WireEncoder::new(PROTO_REV_2);
        msg.encode(&mut enc).unwrap();
        assert_eq!(enc.buffer(), &[0x01, 0x02, 0x00]);
    }

    #[tokio::test]
    async fn test_entry_update_v2_uses_type_lookup() {
        let msg = Message::EntryUpdate {
            id: 4,
            seq_num: SeqNum::new(1),
            value: Value::Boolean(true),
        };
        let mut enc = WireEncoder::new(PROTO_REV_2);
        msg.encode(&mut enc).unwrap();
        let bytes = enc.take();

        let mut reader = WireReader::new(&bytes[..], PROTO_REV_2);
        let decoded = Message::decode(&mut reader, |id| {
            assert_eq!(id, 4);
            ValueType::Boolean
        })
        .await
        .unwrap();
        assert_eq!(decoded, msg);

        // unknown entry type makes the update undecodable
        let mut reader = WireReader::new(&bytes[..], PROTO_REV_2);
        assert!(matches!(
            Message::decode(&mut reader, |_| ValueType::Unassigned).await,
            Err(WireError::UnknownEntryType(4))
        ));
    }

    #[tokio::test]
    async fn test_clear_all_requires_magic() {
        let bytes = [tag::CLEAR_ALL_ENTRIES, 0x00, 0x00, 0x00, 0x01];
        let mut reader = WireReader::new(&bytes[..], PROTO_REV_3);
        assert!(matches!(
            Message::decode(&mut reader, |_| ValueType::Unassigned).await,
            Err(WireError::BadMagic(1))
        ));
    }

    #[tokio::test]
    async fn test_v3_tags_rejected_at_v2() {
        let bytes = [tag::ENTRY_DELETE, 0x00, 0x09];
        let mut reader = WireReader::new(&bytes[..], PROTO_REV_2);
        assert!(matches!(
            Message::decode(&mut reader, |_| ValueType::Unassigned).await,
            Err(WireError::UnknownMessageTag(_))
        ));
    }

    #[tokio::test]
    async fn test_unassigned_id_roundtrip() {
        let msg = assign("/new", UNASSIGNED_ID, 0, Value::Boolean(true));
        assert_eq!(roundtrip(&msg, PROTO_REV_3).await, msg);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn any_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<bool>().prop_map(Value::Boolean),
                any::<f64>().prop_filter("NaN breaks equality", |d| !d.is_nan())
                    .prop_map(Value::Double),
                ".{0,64}".prop_map(Value::Str),
                proptest::collection::vec(any::<bool>(), 0..=255).prop_map(Value::BooleanArray),
                proptest::collection::vec(".{0,8}", 0..=32).prop_map(Value::StringArray),
            ]
        }

        fn block_on<F: std::future::Future>(fut: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(fut)
        }

        proptest! {
            #[test]
            fn prop_entry_assign_roundtrip_v3(
                name in ".{0,32}",
                id in 0u32..0xffff,
                seq in any::<u16>(),
                flags in any::<u8>(),
                value in any_value(),
            ) {
                let msg = Message::EntryAssign {
                    name,
                    id,
                    seq_num: SeqNum::new(seq),
                    flags: EntryFlags::from_bits(flags),
                    value,
                };
                let decoded = block_on(roundtrip(&msg, PROTO_REV_3));
                prop_assert_eq!(decoded, msg);
            }

            #[test]
            fn prop_entry_update_roundtrip_v2(
                id in 0u32..0xffff,
                seq in any::<u16>(),
                d in any::<f64>().prop_filter("NaN breaks equality", |d| !d.is_nan()),
            ) {
                let msg = Message::EntryUpdate {
                    id,
                    seq_num: SeqNum::new(seq),
                    value: Value::Double(d),
                };
                let decoded = block_on(roundtrip(&msg, PROTO_REV_2));
                prop_assert_eq!(decoded, msg);
            }
        }
    }
}
