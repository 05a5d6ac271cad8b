//! Hello exchange and initial entry synchronization.
//!
//! The handshake owns the stream halves until both sides agree on a
//! revision and have exchanged their entry snapshots; only then do the
//! steady-state read/write loops take over.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use nettable_store::Storage;
use nettable_wire::{Message, MessageType, WireEncoder, PROTO_REV_3};

use crate::connection::{Connection, StreamReader, StreamWriter};
use crate::error::{NetError, Result};

/// Abandon a handshake whose peer stops talking.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// One side of the hello exchange.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn perform(
        &self,
        conn: &Arc<Connection>,
        reader: &mut StreamReader,
        writer: &mut StreamWriter,
        storage: &Arc<Storage>,
    ) -> Result<()>;
}

async fn read_msg(reader: &mut StreamReader, storage: &Storage) -> Result<Message> {
    let decoded = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        Message::decode(reader, |id| storage.get_entry_type(id)),
    )
    .await
    .map_err(|_| NetError::Handshake("peer went silent mid-handshake"))?;
    Ok(decoded?)
}

/// Encode a batch and put it on the wire. Messages the negotiated
/// revision cannot express are dropped.
async fn send_msgs(
    writer: &mut StreamWriter,
    enc: &mut WireEncoder,
    msgs: impl IntoIterator<Item = Message>,
) -> Result<()> {
    enc.reset();
    for msg in msgs {
        let mark = enc.len();
        if let Err(err) = msg.encode(enc) {
            enc.truncate(mark);
            debug!(%err, "skipping unencodable message in handshake");
        }
    }
    writer.write_all(enc.buffer()).await?;
    writer.flush().await?;
    Ok(())
}

/// Server side: answer a `ClientHello`, dump every entry, then (3.0)
/// absorb the client's reconciliation batch.
pub struct ServerHandshake {
    identity: String,
    /// Identities that have completed a handshake before. Bit 0 of the
    /// `ServerHello` flags tells a returning client its writes may
    /// still be newer than ours.
    seen_clients: Arc<Mutex<HashSet<String>>>,
}

impl ServerHandshake {
    pub fn new(identity: impl Into<String>, seen_clients: Arc<Mutex<HashSet<String>>>) -> Self {
        Self {
            identity: identity.into(),
            seen_clients,
        }
    }
}

#[async_trait]
impl Handshake for ServerHandshake {
    async fn perform(
        &self,
        conn: &Arc<Connection>,
        reader: &mut StreamReader,
        writer: &mut StreamWriter,
        storage: &Arc<Storage>,
    ) -> Result<()> {
        let hello = read_msg(reader, storage).await?;
        let Message::ClientHello {
            proto_rev,
            identity,
        } = hello
        else {
            return Err(NetError::Handshake("expected client hello"));
        };

        let mut enc = WireEncoder::new(conn.proto_rev());
        if proto_rev > PROTO_REV_3 {
            send_msgs(
                writer,
                &mut enc,
                [Message::ProtoUnsup {
                    proto_rev: PROTO_REV_3,
                }],
            )
            .await?;
            return Err(NetError::Handshake("client requested a newer revision"));
        }

        conn.set_proto_rev(proto_rev);
        conn.set_remote_id(&identity);
        reader.set_proto_rev(proto_rev);
        enc.set_proto_rev(proto_rev);

        let mut batch = Vec::new();
        if proto_rev >= PROTO_REV_3 {
            let seen_before = !self.seen_clients.lock().unwrap().insert(identity.clone());
            batch.push(Message::ServerHello {
                flags: u8::from(seen_before),
                identity: self.identity.clone(),
            });
        }
        batch.extend(storage.get_initial_assignments());
        batch.push(Message::ServerHelloDone);
        send_msgs(writer, &mut enc, batch).await?;

        if proto_rev >= PROTO_REV_3 {
            // the client answers with entries we don't have or where it
            // is ahead, terminated by ClientHelloDone
            let mut incoming = Vec::new();
            loop {
                let msg = read_msg(reader, storage).await?;
                match msg.ty() {
                    MessageType::ClientHelloDone => break,
                    MessageType::EntryAssign | MessageType::EntryUpdate => incoming.push(msg),
                    _ => return Err(NetError::Handshake("unexpected message before client hello done")),
                }
            }
            let token = conn.token();
            for msg in incoming {
                storage.process_incoming(msg, token);
            }
        }

        info!(
            conn = conn.id(),
            client = %identity,
            proto_rev = format!("{proto_rev:#06x}"),
            "server handshake complete"
        );
        Ok(())
    }
}

/// Client side: introduce ourselves, absorb the server's dump,
/// reconcile, and push back what the server is missing.
pub struct ClientHandshake {
    identity: String,
}

impl ClientHandshake {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl Handshake for ClientHandshake {
    async fn perform(
        &self,
        conn: &Arc<Connection>,
        reader: &mut StreamReader,
        writer: &mut StreamWriter,
        storage: &Arc<Storage>,
    ) -> Result<()> {
        let proto_rev = conn.proto_rev();
        let mut enc = WireEncoder::new(proto_rev);
        send_msgs(
            writer,
            &mut enc,
            [Message::ClientHello {
                proto_rev,
                identity: self.identity.clone(),
            }],
        )
        .await?;

        // a server that has seen us before keeps arbitration honest; a
        // fresh one always wins
        let mut new_server = true;
        let mut msg = read_msg(reader, storage).await?;
        if let Message::ProtoUnsup { proto_rev } = msg {
            return Err(NetError::UnsupportedRevision(proto_rev));
        }
        if proto_rev >= PROTO_REV_3 {
            let Message::ServerHello { flags, identity } = msg else {
                return Err(NetError::Handshake("expected server hello"));
            };
            new_server = flags & 0x01 == 0;
            conn.set_remote_id(&identity);
            msg = read_msg(reader, storage).await?;
        }

        let mut incoming = Vec::new();
        loop {
            match msg {
                Message::ServerHelloDone => break,
                Message::EntryAssign { .. } => incoming.push(msg),
                _ => return Err(NetError::Handshake("unexpected message in server dump")),
            }
            msg = read_msg(reader, storage).await?;
        }

        let mut out = storage.apply_initial_assignments(conn.token(), incoming, new_server);
        if proto_rev >= PROTO_REV_3 {
            out.push(Message::ClientHelloDone);
        }
        send_msgs(writer, &mut enc, out).await?;

        info!(
            conn = conn.id(),
            new_server,
            proto_rev = format!("{proto_rev:#06x}"),
            "client handshake complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettable_core::{Notifier, Value};
    use nettable_wire::{PROTO_REV_2, WireReader};

    use crate::transport::{memory, Acceptor, Connector, PeerStream};

    async fn split(
        stream: Box<dyn PeerStream>,
        proto_rev: u32,
    ) -> (StreamReader, StreamWriter) {
        let (r, w) = tokio::io::split(stream);
        (WireReader::new(r, proto_rev), w)
    }

    fn storage(server: bool) -> Arc<Storage> {
        Arc::new(Storage::new(server, Arc::new(Notifier::new())))
    }

    async fn run_pair(
        requested_rev: u32,
        server_storage: Arc<Storage>,
        client_storage: Arc<Storage>,
    ) -> (Result<()>, Result<()>, Arc<Connection>, Arc<Connection>) {
        let (connector, acceptor) = memory::link();
        let client_stream = connector.connect().await.unwrap();
        let server_stream = acceptor.accept().await.unwrap();

        let server_conn = Connection::new(1, ("memory".into(), 0), PROTO_REV_3);
        let client_conn = Connection::new(1, ("memory".into(), 0), requested_rev);

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let server_hs = ServerHandshake::new("server", seen);
        let client_hs = ClientHandshake::new("client");

        let (mut srv_r, mut srv_w) = split(server_stream, PROTO_REV_3).await;
        let (mut cli_r, mut cli_w) = split(client_stream, requested_rev).await;

        let server_side = {
            let conn = server_conn.clone();
            let storage = server_storage.clone();
            async move { server_hs.perform(&conn, &mut srv_r, &mut srv_w, &storage).await }
        };
        let client_side = {
            let conn = client_conn.clone();
            let storage = client_storage.clone();
            async move { client_hs.perform(&conn, &mut cli_r, &mut cli_w, &storage).await }
        };
        let (sr, cr) = tokio::join!(server_side, client_side);
        (sr, cr, server_conn, client_conn)
    }

    #[tokio::test]
    async fn test_v3_handshake_syncs_both_ways() {
        let server_storage = storage(true);
        let client_storage = storage(false);
        server_storage
            .set_entry_value("/from_server", Value::Double(1.5))
            .unwrap();
        client_storage
            .set_entry_value("/from_client", Value::Boolean(true))
            .unwrap();

        let (sr, cr, server_conn, client_conn) =
            run_pair(PROTO_REV_3, server_storage.clone(), client_storage.clone()).await;
        sr.unwrap();
        cr.unwrap();

        assert_eq!(
            client_storage.get_entry_value("/from_server"),
            Some(Value::Double(1.5))
        );
        assert_eq!(
            server_storage.get_entry_value("/from_client"),
            Some(Value::Boolean(true))
        );
        assert_eq!(server_conn.proto_rev(), PROTO_REV_3);
        assert_eq!(client_conn.info().remote_id, "server");
        assert_eq!(server_conn.info().remote_id, "client");
    }

    #[tokio::test]
    async fn test_v2_handshake_dumps_server_entries() {
        let server_storage = storage(true);
        let client_storage = storage(false);
        server_storage
            .set_entry_value("/old", Value::Double(4.0))
            .unwrap();

        let (sr, cr, server_conn, _) =
            run_pair(PROTO_REV_2, server_storage, client_storage.clone()).await;
        sr.unwrap();
        cr.unwrap();

        assert_eq!(server_conn.proto_rev(), PROTO_REV_2);
        assert_eq!(
            client_storage.get_entry_value("/old"),
            Some(Value::Double(4.0))
        );
    }

    #[tokio::test]
    async fn test_newer_client_revision_rejected() {
        let server_storage = storage(true);
        let client_storage = storage(false);

        let (sr, cr, _, _) = run_pair(0x0400, server_storage, client_storage).await;
        assert!(sr.is_err());
        assert!(matches!(cr, Err(NetError::UnsupportedRevision(rev)) if rev == PROTO_REV_3));
    }
}
