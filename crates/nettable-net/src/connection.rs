//! One live peer connection and its read/write tasks.
//!
//! Outbound traffic is not written eagerly: messages accumulate in a
//! pending queue, coalescing per entry id, until the dispatcher's flush
//! tick (or an explicit flush) wakes the writer. Inbound traffic is
//! decoded on a dedicated loop and fed straight into storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::{debug, trace};

use nettable_core::{ConnectionInfo, UNASSIGNED_ID};
use nettable_store::{ConnectionId, ConnectionToken, Storage};
use nettable_wire::{Message, WireEncoder, WireReader};

use crate::error::Result;
use crate::handshake::Handshake;
use crate::transport::PeerStream;

/// Decoder over the inbound half of a peer stream.
pub type StreamReader = WireReader<ReadHalf<Box<dyn PeerStream>>>;
/// Outbound half of a peer stream.
pub type StreamWriter = WriteHalf<Box<dyn PeerStream>>;

/// Connection lifecycle. Forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Built, stream not yet taken over.
    Created,
    /// Stream split, handshake not yet started.
    Init,
    /// Hello exchange and initial sync in progress.
    Handshake,
    /// Handshake complete, nothing flushed yet.
    Synchronized,
    /// Steady state.
    Active,
    /// Torn down; the slot may be reused.
    Dead,
}

/// Outbound queue with per-entry coalescing.
///
/// Slot maps point at indexes into `msgs`; cancelled messages become
/// `None` and are skipped on drain.
#[derive(Default)]
struct Pending {
    msgs: Vec<Option<Message>>,
    assign_slot: HashMap<u32, usize>,
    update_slot: HashMap<u32, usize>,
    flags_slot: HashMap<u32, usize>,
}

impl Pending {
    fn drain(&mut self) -> Vec<Message> {
        self.assign_slot.clear();
        self.update_slot.clear();
        self.flags_slot.clear();
        std::mem::take(&mut self.msgs).into_iter().flatten().collect()
    }

    fn cancel_entry(&mut self, id: u32) {
        for slots in [&mut self.assign_slot, &mut self.update_slot, &mut self.flags_slot] {
            if let Some(i) = slots.remove(&id) {
                self.msgs[i] = None;
            }
        }
    }

    fn cancel_all_entries(&mut self) {
        for slot in self.msgs.iter_mut() {
            let cancel = matches!(
                slot,
                Some(msg) if msg.entry_id().is_some() || msg.is(nettable_wire::MessageType::ClearAllEntries)
            );
            if cancel {
                *slot = None;
            }
        }
        self.assign_slot.clear();
        self.update_slot.clear();
        self.flags_slot.clear();
    }

    fn push(&mut self, msg: Message) {
        match &msg {
            Message::EntryAssign { id, .. } if *id != UNASSIGNED_ID => {
                if let Some(&i) = self.assign_slot.get(id) {
                    self.msgs[i] = Some(msg);
                } else {
                    self.assign_slot.insert(*id, self.msgs.len());
                    self.msgs.push(Some(msg));
                }
            }
            Message::EntryUpdate { id, seq_num, value } if *id != UNASSIGNED_ID => {
                if let Some(&i) = self.assign_slot.get(id) {
                    // fold the update into the not-yet-sent assign
                    if let Some(Message::EntryAssign {
                        seq_num: pending_seq,
                        value: pending_value,
                        ..
                    }) = &mut self.msgs[i]
                    {
                        *pending_seq = *seq_num;
                        *pending_value = value.clone();
                        return;
                    }
                }
                if let Some(&i) = self.update_slot.get(id) {
                    self.msgs[i] = Some(msg);
                } else {
                    self.update_slot.insert(*id, self.msgs.len());
                    self.msgs.push(Some(msg));
                }
            }
            Message::FlagsUpdate { id, flags } => {
                if let Some(&i) = self.assign_slot.get(id) {
                    if let Some(Message::EntryAssign {
                        flags: pending_flags,
                        ..
                    }) = &mut self.msgs[i]
                    {
                        *pending_flags = *flags;
                        return;
                    }
                }
                if let Some(&i) = self.flags_slot.get(id) {
                    self.msgs[i] = Some(msg);
                } else {
                    self.flags_slot.insert(*id, self.msgs.len());
                    self.msgs.push(Some(msg));
                }
            }
            Message::EntryDelete { id } => {
                self.cancel_entry(*id);
                self.msgs.push(Some(msg));
            }
            Message::ClearAllEntries => {
                self.cancel_all_entries();
                self.msgs.push(Some(msg));
            }
            _ => self.msgs.push(Some(msg)),
        }
    }
}

/// Shared handle to one peer connection.
pub struct Connection {
    id: ConnectionId,
    peer: (String, u16),
    proto_rev: AtomicU32,
    state: Mutex<ConnState>,
    remote_id: Mutex<String>,
    last_update_ms: AtomicU64,
    last_post: Mutex<Instant>,
    pending: Mutex<Pending>,
    wake_writer: Notify,
    dead: AtomicBool,
    /// Woken with `notify_one` so the permit survives a close that
    /// lands before the read loop registers its waiter.
    closed: Notify,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Connection {
    /// Build a connection handle. `requested_rev` is the revision we
    /// speak until the handshake settles on one.
    pub fn new(id: ConnectionId, peer: (String, u16), requested_rev: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            proto_rev: AtomicU32::new(requested_rev),
            state: Mutex::new(ConnState::Created),
            remote_id: Mutex::new(String::new()),
            last_update_ms: AtomicU64::new(now_ms()),
            last_post: Mutex::new(Instant::now()),
            pending: Mutex::new(Pending::default()),
            wake_writer: Notify::new(),
            dead: AtomicBool::new(false),
            closed: Notify::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn proto_rev(&self) -> u32 {
        self.proto_rev.load(Ordering::Acquire)
    }

    /// Fix the negotiated revision. Called once, by the handshake.
    pub fn set_proto_rev(&self, proto_rev: u32) {
        self.proto_rev.store(proto_rev, Ordering::Release);
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_remote_id(&self, identity: &str) {
        *self.remote_id.lock().unwrap() = identity.to_owned();
    }

    /// Whether the connection takes part in post-handshake traffic.
    pub fn is_synced(&self) -> bool {
        matches!(self.state(), ConnState::Synchronized | ConnState::Active)
    }

    pub fn token(&self) -> ConnectionToken {
        ConnectionToken {
            id: self.id,
            proto_rev: self.proto_rev(),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_id: self.remote_id.lock().unwrap().clone(),
            remote_ip: self.peer.0.clone(),
            remote_port: self.peer.1,
            last_update: self.last_update_ms.load(Ordering::Relaxed),
            protocol_version: self.proto_rev(),
        }
    }

    /// Queue a message for the next flush.
    pub fn post_outgoing(&self, msg: Message) {
        self.pending.lock().unwrap().push(msg);
        *self.last_post.lock().unwrap() = Instant::now();
    }

    /// Whether nothing is waiting to be flushed.
    pub fn pending_empty(&self) -> bool {
        self.pending.lock().unwrap().msgs.iter().all(|m| m.is_none())
    }

    /// Seconds since the last queued message, for keepalive pacing.
    pub fn secs_since_last_post(&self) -> f64 {
        self.last_post.lock().unwrap().elapsed().as_secs_f64()
    }

    /// Wake the writer to drain the pending queue.
    pub fn notify_flush(&self) {
        self.wake_writer.notify_one();
    }

    /// Tear the connection down. Idempotent; wakes both tasks.
    pub fn close(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            self.set_state(ConnState::Dead);
            self.wake_writer.notify_one();
            self.closed.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Drive the connection to completion: handshake, then concurrent
    /// read and write loops. `on_ready` fires once, right after the
    /// handshake succeeds. Returns when the peer disconnects, a decode
    /// fails, or [`Connection::close`] is called.
    pub async fn run<F>(
        self: Arc<Self>,
        stream: Box<dyn PeerStream>,
        storage: Arc<Storage>,
        handshake: Arc<dyn Handshake>,
        on_ready: F,
    ) -> Result<()>
    where
        F: FnOnce(&Arc<Self>) + Send,
    {
        self.set_state(ConnState::Init);
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = WireReader::new(read_half, self.proto_rev());

        self.set_state(ConnState::Handshake);
        if let Err(err) = handshake
            .perform(&self, &mut reader, &mut write_half, &storage)
            .await
        {
            self.close();
            let _ = write_half.shutdown().await;
            return Err(err);
        }
        reader.set_proto_rev(self.proto_rev());
        self.set_state(ConnState::Synchronized);
        on_ready(&self);

        let writer = {
            let conn = Arc::clone(&self);
            tokio::spawn(conn.write_loop(write_half))
        };
        let result = self.read_loop(&mut reader, &storage).await;

        self.close();
        let _ = writer.await;
        result
    }

    async fn read_loop(
        &self,
        reader: &mut StreamReader,
        storage: &Arc<Storage>,
    ) -> Result<()> {
        let token = self.token();
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let decoded = tokio::select! {
                res = Message::decode(reader, |id| storage.get_entry_type(id)) => res,
                _ = self.closed.notified() => return Ok(()),
            };
            match decoded {
                Ok(Message::KeepAlive) => {
                    trace!(conn = self.id, "keepalive");
                    self.last_update_ms.store(now_ms(), Ordering::Relaxed);
                }
                Ok(msg) => {
                    trace!(conn = self.id, ty = ?msg.ty(), "received");
                    self.last_update_ms.store(now_ms(), Ordering::Relaxed);
                    storage.process_incoming(msg, token);
                }
                Err(err) => {
                    debug!(conn = self.id, %err, "read loop terminating");
                    return Err(err.into());
                }
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: StreamWriter) {
        let mut enc = WireEncoder::new(self.proto_rev());
        loop {
            self.wake_writer.notified().await;
            if self.is_closed() {
                break;
            }
            let msgs = self.pending.lock().unwrap().drain();
            if msgs.is_empty() {
                continue;
            }
            enc.reset();
            for msg in msgs {
                let mark = enc.len();
                if let Err(err) = msg.encode(&mut enc) {
                    // a message the peer's revision can't express is
                    // dropped, not fatal
                    enc.truncate(mark);
                    debug!(conn = self.id, %err, "skipping unencodable message");
                }
            }
            if enc.is_empty() {
                continue;
            }
            if writer.write_all(enc.buffer()).await.is_err() || writer.flush().await.is_err()
            {
                debug!(conn = self.id, "write loop terminating");
                break;
            }
            if self.state() == ConnState::Synchronized {
                self.set_state(ConnState::Active);
            }
        }
        self.close();
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettable_core::{EntryFlags, SeqNum, Value};
    use nettable_wire::PROTO_REV_3;

    fn conn() -> Arc<Connection> {
        Connection::new(1, ("memory".into(), 0), PROTO_REV_3)
    }

    fn assign(id: u32, seq: u16, value: Value) -> Message {
        Message::EntryAssign {
            name: format!("/e{id}"),
            id,
            seq_num: SeqNum::new(seq),
            flags: EntryFlags::NONE,
            value,
        }
    }

    fn update(id: u32, seq: u16, value: Value) -> Message {
        Message::EntryUpdate {
            id,
            seq_num: SeqNum::new(seq),
            value,
        }
    }

    fn drain(conn: &Connection) -> Vec<Message> {
        conn.pending.lock().unwrap().drain()
    }

    #[test]
    fn test_updates_coalesce_per_id() {
        let c = conn();
        c.post_outgoing(update(3, 1, Value::Double(1.0)));
        c.post_outgoing(update(3, 2, Value::Double(2.0)));
        c.post_outgoing(update(4, 1, Value::Double(9.0)));
        let msgs = drain(&c);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(
            msgs[0],
            Message::EntryUpdate { id: 3, seq_num, .. } if seq_num == SeqNum::new(2)
        ));
    }

    #[test]
    fn test_update_folds_into_pending_assign() {
        let c = conn();
        c.post_outgoing(assign(3, 1, Value::Double(1.0)));
        c.post_outgoing(update(3, 2, Value::Double(2.0)));
        let msgs = drain(&c);
        assert_eq!(msgs.len(), 1);
        let Message::EntryAssign { seq_num, value, .. } = &msgs[0] else {
            panic!("expected assign, got {:?}", msgs[0]);
        };
        assert_eq!(*seq_num, SeqNum::new(2));
        assert_eq!(*value, Value::Double(2.0));
    }

    #[test]
    fn test_flags_fold_into_pending_assign() {
        let c = conn();
        c.post_outgoing(assign(5, 1, Value::Boolean(true)));
        c.post_outgoing(Message::FlagsUpdate {
            id: 5,
            flags: EntryFlags::PERSISTENT,
        });
        let msgs = drain(&c);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(
            msgs[0],
            Message::EntryAssign { flags, .. } if flags == EntryFlags::PERSISTENT
        ));
    }

    #[test]
    fn test_delete_cancels_pending_for_id() {
        let c = conn();
        c.post_outgoing(assign(2, 1, Value::Boolean(true)));
        c.post_outgoing(update(7, 1, Value::Double(1.0)));
        c.post_outgoing(Message::EntryDelete { id: 2 });
        let msgs = drain(&c);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Message::EntryUpdate { id: 7, .. }));
        assert!(matches!(msgs[1], Message::EntryDelete { id: 2 }));
    }

    #[test]
    fn test_clear_all_cancels_every_entry_message() {
        let c = conn();
        c.post_outgoing(assign(1, 1, Value::Boolean(true)));
        c.post_outgoing(update(2, 1, Value::Double(1.0)));
        c.post_outgoing(Message::KeepAlive);
        c.post_outgoing(Message::ClearAllEntries);
        let msgs = drain(&c);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Message::KeepAlive));
        assert!(matches!(msgs[1], Message::ClearAllEntries));
    }

    #[test]
    fn test_unassigned_id_never_coalesces() {
        let c = conn();
        c.post_outgoing(assign(UNASSIGNED_ID, 1, Value::Boolean(true)));
        c.post_outgoing(assign(UNASSIGNED_ID, 1, Value::Boolean(false)));
        let msgs = drain(&c);
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn test_drain_resets_queue() {
        let c = conn();
        c.post_outgoing(update(1, 1, Value::Double(1.0)));
        assert!(!c.pending_empty());
        drain(&c);
        assert!(c.pending_empty());
        // a fresh update after drain starts a new slot
        c.post_outgoing(update(1, 2, Value::Double(2.0)));
        assert_eq!(drain(&c).len(), 1);
    }
}
