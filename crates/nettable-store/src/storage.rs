//! The replicated entry table and its arbitration rules.
//!
//! [`Storage`] owns every entry this node knows about, applies both
//! local API mutations and incoming protocol messages, and pushes the
//! resulting wire traffic through an injected outgoing hook. It is the
//! single synchronization point between user threads and protocol
//! tasks; the outgoing hook is always invoked after the internal lock
//! is released.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use nettable_core::{
    notify_flags, Entry, EntryFlags, EntryInfo, Notifier, SeqNum, Value, ValueType, UNASSIGNED_ID,
};
use nettable_wire::{Message, PROTO_REV_3};

use crate::error::{PersistError, Result, StoreError};
use crate::persist;

/// Identifies one live connection. Issued by the dispatcher, never
/// reused within a process.
pub type ConnectionId = u64;

/// What storage needs to know about a message's origin: which
/// connection it came from (so rebroadcasts can exclude it) and that
/// connection's negotiated revision (so 2.0 peers don't get their
/// flags trusted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken {
    pub id: ConnectionId,
    pub proto_rev: u32,
}

/// Hook invoked for every message storage wants on the wire.
///
/// `only` restricts delivery to a single connection; `except` excludes
/// one (the message's origin). At most one of the two is `Some`.
pub type OutgoingFn =
    Arc<dyn Fn(Message, Option<ConnectionId>, Option<ConnectionId>) + Send + Sync>;

struct Inner {
    entries: HashMap<String, Entry>,
    /// Dense id -> name map. `None` slots are free for reuse.
    id_map: Vec<Option<String>>,
    outgoing: Option<OutgoingFn>,
    persistent_dirty: bool,
}

/// One message queued while the lock was held, flushed afterwards.
type Queued = (Message, Option<ConnectionId>, Option<ConnectionId>);

/// The replicated entry table.
pub struct Storage {
    server: bool,
    notifier: Arc<Notifier>,
    inner: Mutex<Inner>,
}

impl Storage {
    pub fn new(server: bool, notifier: Arc<Notifier>) -> Self {
        Self {
            server,
            notifier,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                id_map: Vec::new(),
                outgoing: None,
                persistent_dirty: false,
            }),
        }
    }

    /// Whether this storage arbitrates ids (server role).
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Install or remove the outgoing hook. Installed by the dispatcher
    /// on start, removed on stop so late mutations don't dangle.
    pub fn set_outgoing(&self, outgoing: Option<OutgoingFn>) {
        self.inner.lock().unwrap().outgoing = outgoing;
    }

    /// Deliver queued messages through the outgoing hook. Must be
    /// called with the lock released.
    fn emit(&self, queued: Vec<Queued>) {
        if queued.is_empty() {
            return;
        }
        let outgoing = self.inner.lock().unwrap().outgoing.clone();
        if let Some(outgoing) = outgoing {
            for (msg, only, except) in queued {
                outgoing(msg, only, except);
            }
        }
    }

    // ---- local API ------------------------------------------------

    /// Set an entry's value, creating it if absent. Fails if the entry
    /// exists with a different type.
    pub fn set_entry_value(&self, name: &str, value: Value) -> Result<()> {
        self.set_value_impl(name, value, false, EntryFlags::NONE)
    }

    /// Set an entry's value, replacing the entry outright if the type
    /// differs. The replacement is pushed as a fresh `EntryAssign`.
    pub fn set_entry_type_value(&self, name: &str, value: Value) -> Result<()> {
        self.set_value_impl(name, value, true, EntryFlags::NONE)
    }

    fn set_value_impl(
        &self,
        name: &str,
        value: Value,
        force_type: bool,
        extra_flags: EntryFlags,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            entries,
            id_map,
            persistent_dirty,
            ..
        } = &mut *inner;

        let notify = match entries.get_mut(name) {
            None => {
                let mut entry = Entry::new(name, value.clone());
                entry.seq_num.bump();
                entry.flags = extra_flags;
                if self.server {
                    entry.id = alloc_id(id_map, name);
                }
                queued.push((
                    Message::EntryAssign {
                        name: name.to_owned(),
                        id: entry.id,
                        seq_num: entry.seq_num,
                        flags: entry.flags,
                        value: value.clone(),
                    },
                    None,
                    None,
                ));
                if entry.flags.is_persistent() {
                    *persistent_dirty = true;
                }
                entries.insert(name.to_owned(), entry);
                notify_flags::NEW | notify_flags::LOCAL
            }
            Some(entry) if entry.value == value => return Ok(()),
            Some(entry) => {
                let type_changed = entry.value.ty() != value.ty();
                if type_changed && !force_type {
                    return Err(StoreError::TypeMismatch {
                        name: name.to_owned(),
                        existing: entry.value.ty(),
                        new: value.ty(),
                    });
                }
                entry.value = value.clone();
                entry.seq_num.bump();
                if entry.flags.is_persistent() {
                    *persistent_dirty = true;
                }
                if entry.id != UNASSIGNED_ID {
                    let msg = if type_changed {
                        Message::EntryAssign {
                            name: name.to_owned(),
                            id: entry.id,
                            seq_num: entry.seq_num,
                            flags: entry.flags,
                            value: value.clone(),
                        }
                    } else {
                        Message::EntryUpdate {
                            id: entry.id,
                            seq_num: entry.seq_num,
                            value: value.clone(),
                        }
                    };
                    queued.push((msg, None, None));
                }
                notify_flags::UPDATE | notify_flags::LOCAL
            }
        };
        drop(inner);
        self.notifier.notify_entry(name, Some(value), notify);
        self.emit(queued);
        Ok(())
    }

    /// Set an entry's flags. A no-op for absent entries or unchanged
    /// flags.
    pub fn set_entry_flags(&self, name: &str, flags: EntryFlags) {
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let (id, value) = match inner.entries.get_mut(name) {
            Some(entry) if entry.flags != flags => {
                entry.flags = flags;
                (entry.id, entry.value.clone())
            }
            _ => return,
        };
        // either gaining or losing the persistent bit changes the file
        inner.persistent_dirty = true;
        if id != UNASSIGNED_ID {
            queued.push((Message::FlagsUpdate { id, flags }, None, None));
        }
        drop(inner);
        self.notifier.notify_entry(
            name,
            Some(value),
            notify_flags::FLAGS | notify_flags::LOCAL,
        );
        self.emit(queued);
    }

    pub fn get_entry_value(&self, name: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(name)
            .map(|e| e.value.clone())
    }

    pub fn get_entry_flags(&self, name: &str) -> EntryFlags {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(name)
            .map(|e| e.flags)
            .unwrap_or(EntryFlags::NONE)
    }

    /// Snapshot every entry whose name starts with `prefix`, optionally
    /// filtered by type.
    pub fn get_entry_info(&self, prefix: &str, ty: Option<ValueType>) -> Vec<EntryInfo> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<EntryInfo> = inner
            .entries
            .values()
            .filter(|e| e.name.starts_with(prefix))
            .filter(|e| ty.map_or(true, |t| e.value.ty() == t))
            .map(|e| EntryInfo {
                name: e.name.clone(),
                ty: e.value.ty(),
                flags: e.flags,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Delete one entry. A no-op for absent names.
    pub fn delete_entry(&self, name: &str) {
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let entry = match inner.entries.remove(name) {
            Some(entry) => entry,
            None => return,
        };
        free_id(&mut inner.id_map, entry.id);
        if entry.flags.is_persistent() {
            inner.persistent_dirty = true;
        }
        if entry.id != UNASSIGNED_ID {
            queued.push((Message::EntryDelete { id: entry.id }, None, None));
        }
        drop(inner);
        self.notifier
            .notify_entry(name, None, notify_flags::DELETE | notify_flags::LOCAL);
        self.emit(queued);
    }

    /// Delete every entry.
    pub fn delete_all_entries(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            return;
        }
        let names: Vec<String> = inner.entries.keys().cloned().collect();
        if inner.entries.values().any(|e| e.flags.is_persistent()) {
            inner.persistent_dirty = true;
        }
        inner.entries.clear();
        inner.id_map.clear();
        drop(inner);
        for name in names {
            self.notifier
                .notify_entry(&name, None, notify_flags::DELETE | notify_flags::LOCAL);
        }
        self.emit(vec![(Message::ClearAllEntries, None, None)]);
    }

    // ---- protocol side --------------------------------------------

    /// The wire type of the entry bound to `id`, for decoding 2.0
    /// `EntryUpdate` payloads. `Unassigned` for unknown ids.
    pub fn get_entry_type(&self, id: u32) -> ValueType {
        let inner = self.inner.lock().unwrap();
        lookup_by_id(&inner, id)
            .map(|e| e.value.ty())
            .unwrap_or(ValueType::Unassigned)
    }

    /// Apply one post-handshake message from a peer.
    pub fn process_incoming(&self, msg: Message, token: ConnectionToken) {
        match msg {
            Message::EntryAssign {
                name,
                id,
                seq_num,
                flags,
                value,
            } => self.incoming_assign(token, name, id, seq_num, flags, value),
            Message::EntryUpdate { id, seq_num, value } => {
                self.incoming_update(token, id, seq_num, value)
            }
            Message::FlagsUpdate { id, flags } => self.incoming_flags(token, id, flags),
            Message::EntryDelete { id } => self.incoming_delete(token, id),
            Message::ClearAllEntries => self.incoming_clear_all(token),
            Message::ExecuteRpc { id, uid, .. } => {
                debug!(conn = token.id, id, uid, "dropping rpc execute, no handler");
            }
            Message::RpcResponse { id, uid, .. } => {
                debug!(conn = token.id, id, uid, "dropping rpc response, no handler");
            }
            other => {
                debug!(conn = token.id, ty = ?other.ty(), "unexpected message after handshake");
            }
        }
    }

    fn incoming_assign(
        &self,
        token: ConnectionToken,
        name: String,
        id: u32,
        seq_num: SeqNum,
        flags: EntryFlags,
        value: Value,
    ) {
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        if self.server && id == UNASSIGNED_ID {
            // a create request for a name we already hold is a
            // concurrent create; arbitrate by the circular seq rule
            if inner.entries.contains_key(&name) {
                let notify;
                {
                    let Inner {
                        entries,
                        persistent_dirty,
                        ..
                    } = &mut *inner;
                    let Some(entry) = entries.get_mut(&name) else {
                        return;
                    };
                    if !seq_num.newer_than(entry.seq_num) {
                        debug!(conn = token.id, name, "ignoring stale assign for existing entry");
                        return;
                    }
                    entry.value = value.clone();
                    entry.seq_num = seq_num;
                    let mut kind = notify_flags::UPDATE;
                    // 2.0 assigns carry no flags byte; never trust flags
                    // from them
                    if token.proto_rev >= PROTO_REV_3 && entry.flags != flags {
                        entry.flags = flags;
                        kind |= notify_flags::FLAGS;
                    }
                    if entry.flags.is_persistent() {
                        *persistent_dirty = true;
                    }
                    notify = kind;
                    // completed assign goes to everyone, the originator
                    // included, so it learns the id
                    queued.push((
                        Message::EntryAssign {
                            name: name.clone(),
                            id: entry.id,
                            seq_num,
                            flags: entry.flags,
                            value: value.clone(),
                        },
                        None,
                        None,
                    ));
                }
                drop(inner);
                self.notifier.notify_entry(&name, Some(value), notify);
                self.emit(queued);
                return;
            }
            // client asks us to create the entry and assign an id
            let assigned = alloc_id(&mut inner.id_map, &name);
            let entry = Entry {
                name: name.clone(),
                value: value.clone(),
                id: assigned,
                seq_num,
                flags,
                local: false,
            };
            if flags.is_persistent() {
                inner.persistent_dirty = true;
            }
            inner.entries.insert(name.clone(), entry);
            // completed assign goes to everyone, the originator included,
            // so it learns the id
            queued.push((
                Message::EntryAssign {
                    name: name.clone(),
                    id: assigned,
                    seq_num,
                    flags,
                    value: value.clone(),
                },
                None,
                None,
            ));
            drop(inner);
            self.notifier
                .notify_entry(&name, Some(value), notify_flags::NEW);
            self.emit(queued);
            return;
        }

        if self.server {
            // id must already be known; clients cannot mint ids
            if lookup_by_id(&inner, id).is_none() {
                debug!(conn = token.id, id, "ignoring assign to unknown id");
                return;
            }
        } else {
            if id == UNASSIGNED_ID {
                debug!(conn = token.id, "ignoring assign request sent to a client");
                return;
            }
            if (id as usize) >= inner.id_map.len() {
                inner.id_map.resize(id as usize + 1, None);
            }
            if inner.id_map[id as usize].is_none() {
                // new binding from the server; the name may already exist
                // locally from before this id was issued
                let existed = inner.entries.contains_key(&name);
                let entry = Entry {
                    name: name.clone(),
                    value: value.clone(),
                    id,
                    seq_num,
                    flags,
                    local: false,
                };
                if flags.is_persistent() {
                    inner.persistent_dirty = true;
                }
                inner.entries.insert(name.clone(), entry);
                inner.id_map[id as usize] = Some(name.clone());
                drop(inner);
                let kind = if existed {
                    notify_flags::UPDATE
                } else {
                    notify_flags::NEW
                };
                self.notifier.notify_entry(&name, Some(value), kind);
                return;
            }
        }

        // re-assign of a known id: take it only if strictly newer
        let Inner {
            entries,
            id_map,
            persistent_dirty,
            ..
        } = &mut *inner;
        let bound_name = match id_map.get(id as usize).and_then(|s| s.as_ref()) {
            Some(n) => n.clone(),
            None => return,
        };
        let entry = match entries.get_mut(&bound_name) {
            Some(e) => e,
            None => return,
        };
        if !seq_num.newer_than(entry.seq_num) {
            debug!(conn = token.id, id, "ignoring stale assign");
            return;
        }
        entry.value = value.clone();
        entry.seq_num = seq_num;
        let mut notify = notify_flags::UPDATE;
        // 2.0 assigns carry no flags byte; never trust flags from them
        if token.proto_rev >= PROTO_REV_3 && entry.flags != flags {
            entry.flags = flags;
            notify |= notify_flags::FLAGS;
        }
        if entry.flags.is_persistent() {
            *persistent_dirty = true;
        }
        let rebroadcast = Message::EntryAssign {
            name: bound_name.clone(),
            id,
            seq_num,
            flags: entry.flags,
            value: value.clone(),
        };
        if self.server {
            queued.push((rebroadcast, None, Some(token.id)));
        }
        drop(inner);
        self.notifier.notify_entry(&bound_name, Some(value), notify);
        self.emit(queued);
    }

    fn incoming_update(&self, token: ConnectionToken, id: u32, seq_num: SeqNum, value: Value) {
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            entries,
            id_map,
            persistent_dirty,
            ..
        } = &mut *inner;
        let name = match id_map.get(id as usize).and_then(|s| s.as_ref()) {
            Some(n) => n.clone(),
            None => {
                debug!(conn = token.id, id, "ignoring update to unknown id");
                return;
            }
        };
        let entry = match entries.get_mut(&name) {
            Some(e) => e,
            None => return,
        };
        if !seq_num.newer_than(entry.seq_num) {
            debug!(conn = token.id, id, seq = %seq_num, "ignoring stale update");
            return;
        }
        entry.value = value.clone();
        entry.seq_num = seq_num;
        if entry.flags.is_persistent() {
            *persistent_dirty = true;
        }
        if self.server {
            queued.push((
                Message::EntryUpdate {
                    id,
                    seq_num,
                    value: value.clone(),
                },
                None,
                Some(token.id),
            ));
        }
        drop(inner);
        self.notifier
            .notify_entry(&name, Some(value), notify_flags::UPDATE);
        self.emit(queued);
    }

    fn incoming_flags(&self, token: ConnectionToken, id: u32, flags: EntryFlags) {
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            entries,
            id_map,
            persistent_dirty,
            ..
        } = &mut *inner;
        let name = match id_map.get(id as usize).and_then(|s| s.as_ref()) {
            Some(n) => n.clone(),
            None => {
                debug!(conn = token.id, id, "ignoring flags update to unknown id");
                return;
            }
        };
        let value = match entries.get_mut(&name) {
            Some(entry) if entry.flags != flags => {
                entry.flags = flags;
                entry.value.clone()
            }
            _ => return,
        };
        *persistent_dirty = true;
        if self.server {
            queued.push((Message::FlagsUpdate { id, flags }, None, Some(token.id)));
        }
        drop(inner);
        self.notifier
            .notify_entry(&name, Some(value), notify_flags::FLAGS);
        self.emit(queued);
    }

    fn incoming_delete(&self, token: ConnectionToken, id: u32) {
        let mut queued = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let name = match inner.id_map.get(id as usize).and_then(|s| s.clone()) {
            Some(n) => n,
            None => {
                debug!(conn = token.id, id, "ignoring delete of unknown id");
                return;
            }
        };
        let entry = match inner.entries.remove(&name) {
            Some(e) => e,
            None => return,
        };
        free_id(&mut inner.id_map, entry.id);
        if entry.flags.is_persistent() {
            inner.persistent_dirty = true;
        }
        if self.server {
            queued.push((Message::EntryDelete { id }, None, Some(token.id)));
        }
        drop(inner);
        self.notifier.notify_entry(&name, None, notify_flags::DELETE);
        self.emit(queued);
    }

    fn incoming_clear_all(&self, token: ConnectionToken) {
        let mut inner = self.inner.lock().unwrap();
        let names: Vec<String> = inner.entries.keys().cloned().collect();
        if inner.entries.values().any(|e| e.flags.is_persistent()) {
            inner.persistent_dirty = true;
        }
        inner.entries.clear();
        inner.id_map.clear();
        let mut queued = Vec::new();
        if self.server {
            queued.push((Message::ClearAllEntries, None, Some(token.id)));
        }
        drop(inner);
        for name in names {
            self.notifier.notify_entry(&name, None, notify_flags::DELETE);
        }
        self.emit(queued);
    }

    // ---- handshake support ----------------------------------------

    /// Snapshot every entry as an `EntryAssign`, for the server's
    /// initial dump. All entries have ids on the server.
    pub fn get_initial_assignments(&self) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Message> = inner
            .entries
            .values()
            .map(|e| Message::EntryAssign {
                name: e.name.clone(),
                id: e.id,
                seq_num: e.seq_num,
                flags: e.flags,
                value: e.value.clone(),
            })
            .collect();
        // deterministic order helps tests; the protocol doesn't care
        out.sort_by_key(|m| m.entry_id());
        out
    }

    /// Reconcile the server's initial dump against local state (client
    /// side). Returns the messages the client must send back: updates
    /// for locally newer values, assigns for entries the server has
    /// never seen.
    ///
    /// Local entries always adopt the server's id. For a name both
    /// sides know, the server's value wins unless the local sequence
    /// number is circularly no older and the server is not freshly
    /// started (`new_server` false), in which case the local value is
    /// kept and pushed back.
    pub fn apply_initial_assignments(
        &self,
        token: ConnectionToken,
        msgs: Vec<Message>,
        new_server: bool,
    ) -> Vec<Message> {
        let mut out = Vec::new();
        let mut notifications = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        // every id binding is stale after a (re)connect
        inner.id_map.clear();
        for entry in inner.entries.values_mut() {
            entry.id = UNASSIGNED_ID;
        }

        for msg in msgs {
            let Message::EntryAssign {
                name,
                id,
                seq_num,
                flags,
                value,
            } = msg
            else {
                debug!(conn = token.id, ty = ?msg.ty(), "non-assign in initial dump, skipping");
                continue;
            };
            if id == UNASSIGNED_ID {
                debug!(conn = token.id, name, "initial assign without id, skipping");
                continue;
            }
            let Inner {
                entries,
                id_map,
                persistent_dirty,
                ..
            } = &mut *inner;
            if (id as usize) >= id_map.len() {
                id_map.resize(id as usize + 1, None);
            }
            match entries.get_mut(&name) {
                None => {
                    entries.insert(
                        name.clone(),
                        Entry {
                            name: name.clone(),
                            value: value.clone(),
                            id,
                            seq_num,
                            flags,
                            local: false,
                        },
                    );
                    if flags.is_persistent() {
                        *persistent_dirty = true;
                    }
                    notifications.push((name.clone(), Some(value), notify_flags::NEW));
                }
                Some(entry) => {
                    if seq_num.newer_than(entry.seq_num) || new_server {
                        entry.value = value.clone();
                        entry.seq_num = seq_num;
                        if token.proto_rev >= PROTO_REV_3 {
                            entry.flags = flags;
                        }
                        notifications.push((name.clone(), Some(value), notify_flags::UPDATE));
                    } else if entry.value != value {
                        // locally no older against a surviving server:
                        // our write wins, tell the server
                        out.push(Message::EntryUpdate {
                            id,
                            seq_num: entry.seq_num,
                            value: entry.value.clone(),
                        });
                    }
                    entry.id = id;
                }
            }
            id_map[id as usize] = Some(name);
        }

        // anything still without an id is unknown to the server
        for entry in inner.entries.values() {
            if entry.id == UNASSIGNED_ID {
                out.push(Message::EntryAssign {
                    name: entry.name.clone(),
                    id: UNASSIGNED_ID,
                    seq_num: entry.seq_num,
                    flags: entry.flags,
                    value: entry.value.clone(),
                });
            }
        }
        drop(inner);
        for (name, value, kind) in notifications {
            self.notifier.notify_entry(&name, value, kind);
        }
        out
    }

    // ---- persistence ----------------------------------------------

    /// Whether persistent entries changed since the last save.
    pub fn persistent_dirty(&self) -> bool {
        self.inner.lock().unwrap().persistent_dirty
    }

    /// Write all persistent entries to `path`, atomically via a
    /// temporary file in the same directory. Clears the dirty bit.
    pub fn save_persistent(&self, path: &Path) -> Result<(), PersistError> {
        let text = {
            let mut inner = self.inner.lock().unwrap();
            let mut persistent: Vec<(String, Value)> = inner
                .entries
                .values()
                .filter(|e| e.flags.is_persistent())
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect();
            persistent.sort_by(|a, b| a.0.cmp(&b.0));
            inner.persistent_dirty = false;
            persist::serialize(&persistent)
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load entries from `path`, marking each persistent and treating
    /// each as a local type-forcing set. Returns per-line warnings for
    /// entries that could not be parsed.
    pub fn load_persistent(&self, path: &Path) -> Result<Vec<(usize, String)>, PersistError> {
        let text = std::fs::read_to_string(path)?;
        let (loaded, warnings) = persist::parse(&text)?;
        for (name, value) in loaded {
            if let Err(err) =
                self.set_value_impl(&name, value, true, EntryFlags::PERSISTENT)
            {
                debug!(name, %err, "skipping persistent entry");
            }
            // the flag must stick even when the entry already existed
            let flags = self.get_entry_flags(&name) | EntryFlags::PERSISTENT;
            self.set_entry_flags(&name, flags);
        }
        Ok(warnings)
    }
}

/// Find or extend a free slot in the dense id map.
fn alloc_id(id_map: &mut Vec<Option<String>>, name: &str) -> u32 {
    for (i, slot) in id_map.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(name.to_owned());
            return i as u32;
        }
    }
    id_map.push(Some(name.to_owned()));
    (id_map.len() - 1) as u32
}

fn free_id(id_map: &mut [Option<String>], id: u32) {
    if let Some(slot) = id_map.get_mut(id as usize) {
        *slot = None;
    }
}

fn lookup_by_id<'a>(inner: &'a Inner, id: u32) -> Option<&'a Entry> {
    inner
        .id_map
        .get(id as usize)
        .and_then(|s| s.as_ref())
        .and_then(|name| inner.entries.get(name))
}
