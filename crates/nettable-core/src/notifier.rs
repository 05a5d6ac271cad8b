//! Asynchronous fan-out of entry-changed and connection-changed events.
//!
//! Protocol tasks never invoke consumer callbacks directly; they push
//! events into an unbounded channel drained by a dedicated task. A slow
//! listener therefore cannot stall a read loop or the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection_info::ConnectionInfo;
use crate::value::Value;

/// Bit flags describing an entry notification.
pub mod notify_flags {
    /// Delivered as part of listener registration, not a live change.
    pub const IMMEDIATE: u32 = 0x01;
    /// The change originated from local API rather than a peer.
    pub const LOCAL: u32 = 0x02;
    /// The entry was created.
    pub const NEW: u32 = 0x04;
    /// The entry was deleted.
    pub const DELETE: u32 = 0x08;
    /// The entry's value changed.
    pub const UPDATE: u32 = 0x10;
    /// The entry's flags changed.
    pub const FLAGS: u32 = 0x20;
}

/// Opaque handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

/// An entry change delivered to listeners.
#[derive(Debug, Clone)]
pub struct EntryNotification {
    pub name: String,
    pub value: Option<Value>,
    pub flags: u32,
}

/// A connection change delivered to listeners.
#[derive(Debug, Clone)]
pub struct ConnectionNotification {
    pub connected: bool,
    pub info: ConnectionInfo,
}

/// Callback type for entry listeners.
pub type EntryCallback = Arc<dyn Fn(&EntryNotification) + Send + Sync>;

/// Callback type for connection listeners.
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionNotification) + Send + Sync>;

enum Event {
    Entry(EntryNotification),
    Connection(ConnectionNotification),
}

struct EntryListener {
    prefix: String,
    flags: u32,
    callback: EntryCallback,
}

struct Registry {
    entry: HashMap<ListenerId, EntryListener>,
    connection: HashMap<ListenerId, ConnectionCallback>,
}

/// Asynchronous event fan-out.
///
/// [`Notifier::start`] must be called from within a tokio runtime before
/// any events are delivered; events raised before that are dropped.
pub struct Notifier {
    registry: Arc<Mutex<Registry>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl Notifier {
    /// Create a stopped notifier.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                entry: HashMap::new(),
                connection: HashMap::new(),
            })),
            tx: Mutex::new(None),
            task: Mutex::new(None),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Start the delivery task. Idempotent.
    pub fn start(&self) {
        let mut tx_guard = self.tx.lock().unwrap();
        if tx_guard.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&registry, event);
            }
        });
        *tx_guard = Some(tx);
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the delivery task, dropping any undelivered events.
    pub async fn stop(&self) {
        let handle = {
            self.tx.lock().unwrap().take();
            self.task.lock().unwrap().take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Register an entry listener for names starting with `prefix`.
    ///
    /// `flags` selects the change kinds of interest (see
    /// [`notify_flags`]); the [`notify_flags::LOCAL`] bit must be set to
    /// also receive locally originated changes.
    pub fn add_entry_listener(
        &self,
        prefix: impl Into<String>,
        flags: u32,
        callback: EntryCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.lock().unwrap().entry.insert(
            id,
            EntryListener {
                prefix: prefix.into(),
                flags,
                callback,
            },
        );
        id
    }

    /// Remove an entry listener. Unknown ids are ignored.
    pub fn remove_entry_listener(&self, id: ListenerId) {
        self.registry.lock().unwrap().entry.remove(&id);
    }

    /// Register a connection listener.
    pub fn add_connection_listener(&self, callback: ConnectionCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.lock().unwrap().connection.insert(id, callback);
        id
    }

    /// Remove a connection listener. Unknown ids are ignored.
    pub fn remove_connection_listener(&self, id: ListenerId) {
        self.registry.lock().unwrap().connection.remove(&id);
    }

    /// Queue an entry notification for delivery.
    pub fn notify_entry(&self, name: &str, value: Option<Value>, flags: u32) {
        self.send(Event::Entry(EntryNotification {
            name: name.to_owned(),
            value,
            flags,
        }));
    }

    /// Queue a connection notification for delivery.
    pub fn notify_connection(&self, connected: bool, info: ConnectionInfo) {
        self.send(Event::Connection(ConnectionNotification { connected, info }));
    }

    fn send(&self, event: Event) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            // receiver only closes on stop(); drop is fine then
            let _ = tx.send(event);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(registry: &Mutex<Registry>, event: Event) {
    // snapshot callbacks so user code runs outside the registry lock
    match event {
        Event::Entry(notification) => {
            let targets: Vec<EntryCallback> = {
                let reg = registry.lock().unwrap();
                reg.entry
                    .values()
                    .filter(|l| wants(l, &notification))
                    .map(|l| Arc::clone(&l.callback))
                    .collect()
            };
            for callback in targets {
                callback(&notification);
            }
        }
        Event::Connection(notification) => {
            let targets: Vec<ConnectionCallback> = {
                let reg = registry.lock().unwrap();
                reg.connection.values().cloned().collect()
            };
            for callback in targets {
                callback(&notification);
            }
        }
    }
}

fn wants(listener: &EntryListener, notification: &EntryNotification) -> bool {
    if !notification.name.starts_with(&listener.prefix) {
        return false;
    }
    let kind_mask = notify_flags::NEW | notify_flags::DELETE | notify_flags::UPDATE | notify_flags::FLAGS;
    if listener.flags & notification.flags & kind_mask == 0 {
        return false;
    }
    if notification.flags & notify_flags::LOCAL != 0 && listener.flags & notify_flags::LOCAL == 0 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting_listener() -> (EntryCallback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        let cb: EntryCallback = Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_entry_listener_prefix_filter() {
        let notifier = Notifier::new();
        notifier.start();
        let (cb, count) = counting_listener();
        notifier.add_entry_listener("/match/", notify_flags::UPDATE, cb);

        notifier.notify_entry("/match/a", Some(Value::Boolean(true)), notify_flags::UPDATE);
        notifier.notify_entry("/other/b", Some(Value::Boolean(true)), notify_flags::UPDATE);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn test_local_events_need_local_flag() {
        let notifier = Notifier::new();
        notifier.start();
        let (cb, count) = counting_listener();
        notifier.add_entry_listener("", notify_flags::UPDATE, cb);

        notifier.notify_entry(
            "x",
            Some(Value::Double(1.0)),
            notify_flags::UPDATE | notify_flags::LOCAL,
        );
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let (cb, count) = counting_listener();
        notifier.add_entry_listener("", notify_flags::UPDATE | notify_flags::LOCAL, cb);
        notifier.notify_entry(
            "x",
            Some(Value::Double(2.0)),
            notify_flags::UPDATE | notify_flags::LOCAL,
        );
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let notifier = Notifier::new();
        notifier.start();
        let (cb, count) = counting_listener();
        let id = notifier.add_entry_listener("", notify_flags::NEW, cb);
        notifier.remove_entry_listener(id);

        notifier.notify_entry("x", Some(Value::Boolean(true)), notify_flags::NEW);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn test_connection_listener() {
        let notifier = Notifier::new();
        notifier.start();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = Arc::clone(&seen);
        notifier.add_connection_listener(Arc::new(move |n| {
            if n.connected {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        notifier.notify_connection(
            true,
            ConnectionInfo {
                remote_id: "peer".into(),
                remote_ip: "127.0.0.1".into(),
                remote_port: 1735,
                last_update: 0,
                protocol_version: 0x0300,
            },
        );
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        notifier.stop().await;
    }
}
