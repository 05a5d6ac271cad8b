//! Lifecycle owner for all connections of one node.
//!
//! A dispatcher runs in exactly one role. The server accepts any number
//! of peers and reuses dead connection slots; the client maintains one
//! connection, retried round-robin across its connectors every 250ms.
//! A periodic tick drains every connection's pending queue, paces
//! client keepalives, and (server side) writes the persistence file
//! when it is dirty.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nettable_core::{ConnectionInfo, Notifier};
use nettable_store::Storage;
use nettable_wire::{Message, PROTO_REV_2, PROTO_REV_3};

use crate::connection::Connection;
use crate::error::NetError;
use crate::handshake::{ClientHandshake, Handshake, ServerHandshake};
use crate::transport::{Acceptor, Connector};

/// Fastest allowed flush tick.
const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
/// Slowest allowed flush tick.
const MAX_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);
/// Delay between client connect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(250);
/// Minimum spacing between persistence file writes.
const SAVE_INTERVAL: Duration = Duration::from_secs(1);
/// A client with nothing to say for this long sends a keepalive.
const KEEPALIVE_AFTER: Duration = Duration::from_secs(1);

/// Owns the dispatch, accept and reconnect tasks for one node.
pub struct Dispatcher {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    server: bool,
    identity: Mutex<String>,
    update_interval: Mutex<Duration>,
    last_flush: Mutex<Option<Instant>>,
    connections: Mutex<Vec<Option<Arc<Connection>>>>,
    seen_clients: Arc<Mutex<HashSet<String>>>,
    next_conn_id: AtomicU64,
    /// Revision the client asks for; dropped to 2.0 after the server
    /// rejects 3.0.
    requested_rev: AtomicU32,
    active: AtomicBool,
    shutdown: Notify,
    flush_now: Notify,
    acceptor: Mutex<Option<Arc<dyn Acceptor>>>,
    persist_path: Mutex<Option<PathBuf>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        server: bool,
        identity: impl Into<String>,
        storage: Arc<Storage>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            notifier,
            server,
            identity: Mutex::new(identity.into()),
            update_interval: Mutex::new(MIN_UPDATE_INTERVAL),
            last_flush: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            seen_clients: Arc::new(Mutex::new(HashSet::new())),
            next_conn_id: AtomicU64::new(1),
            requested_rev: AtomicU32::new(PROTO_REV_3),
            active: AtomicBool::new(false),
            shutdown: Notify::new(),
            flush_now: Notify::new(),
            acceptor: Mutex::new(None),
            persist_path: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// How often pending queues are drained onto the wire. Clamped to
    /// [100ms, 1000ms].
    pub fn set_update_rate(&self, interval: Duration) {
        let clamped = interval.clamp(MIN_UPDATE_INTERVAL, MAX_UPDATE_INTERVAL);
        *self.update_interval.lock().unwrap() = clamped;
    }

    pub fn update_rate(&self) -> Duration {
        *self.update_interval.lock().unwrap()
    }

    /// Start in server role. Loads the persistence file (when given)
    /// before accepting anyone.
    pub fn start_server(
        self: &Arc<Self>,
        acceptor: Arc<dyn Acceptor>,
        persist_path: Option<PathBuf>,
    ) {
        debug_assert!(self.server);
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notifier.start();
        if let Some(path) = &persist_path {
            if path.exists() {
                match self.storage.load_persistent(path) {
                    Ok(warnings) => {
                        for (line, msg) in warnings {
                            warn!(line, %msg, "bad line in persistence file");
                        }
                    }
                    Err(err) => warn!(%err, "could not load persistence file"),
                }
            }
        }
        *self.persist_path.lock().unwrap() = persist_path;
        *self.acceptor.lock().unwrap() = Some(acceptor.clone());
        self.install_outgoing_hook();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push({
            let d = Arc::clone(self);
            tokio::spawn(async move { d.dispatch_loop().await })
        });
        tasks.push({
            let d = Arc::clone(self);
            tokio::spawn(async move { d.accept_loop(acceptor).await })
        });
    }

    /// Start in client role, dialing `connectors` round-robin.
    pub fn start_client(self: &Arc<Self>, connectors: Vec<Arc<dyn Connector>>) {
        debug_assert!(!self.server);
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notifier.start();
        self.install_outgoing_hook();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push({
            let d = Arc::clone(self);
            tokio::spawn(async move { d.dispatch_loop().await })
        });
        tasks.push({
            let d = Arc::clone(self);
            tokio::spawn(async move { d.reconnect_loop(connectors).await })
        });
    }

    /// Stop all tasks, close all connections, write a final save.
    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            acceptor.shutdown();
        }
        for conn in self.connections.lock().unwrap().iter().flatten() {
            conn.close();
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.storage.set_outgoing(None);
        self.connections.lock().unwrap().clear();
        let path = self.persist_path.lock().unwrap().clone();
        if let Some(path) = path {
            if self.storage.persistent_dirty() {
                if let Err(err) = self.storage.save_persistent(&path) {
                    warn!(%err, "final persistence save failed");
                }
            }
        }
        self.notifier.stop().await;
    }

    /// Drain every pending queue now instead of at the next tick.
    /// Rate-limited to one wake per minimum update interval.
    pub fn flush(&self) {
        let mut last = self.last_flush.lock().unwrap();
        if last.is_some_and(|at| at.elapsed() < MIN_UPDATE_INTERVAL) {
            return;
        }
        *last = Some(Instant::now());
        self.flush_now.notify_one();
    }

    /// Change the identity announced in future handshakes. Existing
    /// connections are unaffected.
    pub fn set_identity(&self, identity: impl Into<String>) {
        *self.identity.lock().unwrap() = identity.into();
    }

    pub fn identity(&self) -> String {
        self.identity.lock().unwrap().clone()
    }

    /// Replay a connected notification for every synchronized
    /// connection, so a freshly added listener sees the current set.
    pub fn notify_connections(&self) {
        for conn in self.connections.lock().unwrap().iter().flatten() {
            if conn.is_synced() {
                self.notifier.notify_connection(true, conn.info());
            }
        }
    }

    /// Snapshot of every synchronized connection.
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|c| c.is_synced())
            .map(|c| c.info())
            .collect()
    }

    fn install_outgoing_hook(self: &Arc<Self>) {
        let weak: Weak<Dispatcher> = Arc::downgrade(self);
        self.storage.set_outgoing(Some(Arc::new(move |msg, only, except| {
            let Some(dispatcher) = weak.upgrade() else {
                return;
            };
            let conns = dispatcher.connections.lock().unwrap();
            for conn in conns.iter().flatten() {
                if !conn.is_synced() {
                    continue;
                }
                if only.is_some_and(|id| conn.id() != id) {
                    continue;
                }
                if except.is_some_and(|id| conn.id() == id) {
                    continue;
                }
                conn.post_outgoing(msg.clone());
            }
        })));
    }

    /// Sleep for `dur` unless shutdown arrives first. Returns false on
    /// shutdown.
    async fn sleep_unless_shutdown(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.shutdown.notified() => false,
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut last_save = Instant::now();
        let mut ticks = 0u64;
        loop {
            let interval = self.update_rate();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.flush_now.notified() => {}
                _ = self.shutdown.notified() => break,
            }
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            ticks += 1;
            if ticks % 10 == 0 {
                debug!(ticks, "dispatch alive");
            }
            {
                let conns = self.connections.lock().unwrap();
                for conn in conns.iter().flatten() {
                    if !conn.is_synced() {
                        continue;
                    }
                    // keepalives flow client -> server only
                    if !self.server
                        && conn.pending_empty()
                        && conn.secs_since_last_post() >= KEEPALIVE_AFTER.as_secs_f64()
                    {
                        conn.post_outgoing(Message::KeepAlive);
                    }
                    conn.notify_flush();
                }
            }
            if self.server
                && self.storage.persistent_dirty()
                && last_save.elapsed() >= SAVE_INTERVAL
            {
                let path = self.persist_path.lock().unwrap().clone();
                if let Some(path) = path {
                    if let Err(err) = self.storage.save_persistent(&path) {
                        warn!(%err, "periodic persistence save failed");
                    }
                    last_save = Instant::now();
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, acceptor: Arc<dyn Acceptor>) {
        loop {
            match acceptor.accept().await {
                Ok(stream) => {
                    let d = Arc::clone(&self);
                    let mut tasks = self.tasks.lock().unwrap();
                    tasks.push(tokio::spawn(async move { d.serve_peer(stream).await }));
                }
                Err(NetError::Shutdown) => break,
                Err(err) => {
                    debug!(%err, "accept failed");
                    if !self.sleep_unless_shutdown(RECONNECT_DELAY).await {
                        break;
                    }
                }
            }
        }
    }

    async fn serve_peer(self: Arc<Self>, stream: Box<dyn crate::transport::PeerStream>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr();
        let conn = Connection::new(id, peer, PROTO_REV_3);
        self.adopt(conn.clone());

        let handshake: Arc<dyn Handshake> = Arc::new(ServerHandshake::new(
            self.identity(),
            Arc::clone(&self.seen_clients),
        ));
        let synced = Arc::new(AtomicBool::new(false));
        let result = {
            let notifier = Arc::clone(&self.notifier);
            let synced = Arc::clone(&synced);
            conn.clone()
                .run(stream, Arc::clone(&self.storage), handshake, move |c| {
                    synced.store(true, Ordering::Release);
                    notifier.notify_connection(true, c.info());
                })
                .await
        };
        if let Err(err) = result {
            debug!(conn = id, %err, "server connection ended");
        }
        if synced.load(Ordering::Acquire) {
            self.notifier.notify_connection(false, conn.info());
        }
    }

    async fn reconnect_loop(self: Arc<Self>, connectors: Vec<Arc<dyn Connector>>) {
        if connectors.is_empty() {
            warn!("client started with no connectors");
            return;
        }
        let mut which = 0usize;
        while self.active.load(Ordering::Acquire) {
            let connector = &connectors[which % connectors.len()];
            which = which.wrapping_add(1);

            let stream = match connector.connect().await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(target = %connector.target(), %err, "connect failed");
                    if !self.sleep_unless_shutdown(RECONNECT_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let peer = stream.peer_addr();
            let conn = Connection::new(id, peer, self.requested_rev.load(Ordering::Acquire));
            // the client keeps exactly one connection
            *self.connections.lock().unwrap() = vec![Some(conn.clone())];

            let handshake: Arc<dyn Handshake> =
                Arc::new(ClientHandshake::new(self.identity()));
            let synced = Arc::new(AtomicBool::new(false));
            let result = {
                let notifier = Arc::clone(&self.notifier);
                let synced = Arc::clone(&synced);
                conn.clone()
                    .run(stream, Arc::clone(&self.storage), handshake, move |c| {
                        synced.store(true, Ordering::Release);
                        notifier.notify_connection(true, c.info());
                    })
                    .await
            };
            match result {
                Err(NetError::UnsupportedRevision(rev)) if rev == PROTO_REV_2 => {
                    info!("server speaks 2.0 only, downgrading");
                    self.requested_rev.store(PROTO_REV_2, Ordering::Release);
                }
                Err(NetError::UnsupportedRevision(rev)) => {
                    warn!("server revision {rev:#06x} not supported");
                }
                Err(err) => debug!(conn = id, %err, "client connection ended"),
                Ok(()) => {}
            }
            if synced.load(Ordering::Acquire) {
                self.notifier.notify_connection(false, conn.info());
            }
            self.connections.lock().unwrap().clear();
            if !self.sleep_unless_shutdown(RECONNECT_DELAY).await {
                break;
            }
        }
    }

    /// Server side: put a connection in the first dead slot, or grow.
    fn adopt(&self, conn: Arc<Connection>) {
        let mut conns = self.connections.lock().unwrap();
        for slot in conns.iter_mut() {
            let reusable = match slot {
                None => true,
                Some(existing) => existing.is_closed(),
            };
            if reusable {
                *slot = Some(conn);
                return;
            }
        }
        conns.push(Some(conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettable_core::Value;
    use crate::transport::memory;

    fn node(server: bool, identity: &str) -> (Arc<Dispatcher>, Arc<Storage>) {
        let notifier = Arc::new(Notifier::new());
        let storage = Arc::new(Storage::new(server, Arc::clone(&notifier)));
        let dispatcher = Dispatcher::new(server, identity, Arc::clone(&storage), notifier);
        (dispatcher, storage)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn test_update_rate_clamped() {
        let (d, _) = node(true, "server");
        d.set_update_rate(Duration::from_millis(1));
        assert_eq!(d.update_rate(), Duration::from_millis(100));
        d.set_update_rate(Duration::from_secs(30));
        assert_eq!(d.update_rate(), Duration::from_millis(1000));
        d.set_update_rate(Duration::from_millis(300));
        assert_eq!(d.update_rate(), Duration::from_millis(300));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_value_reaches_client() {
        let (connector, acceptor) = memory::link();
        let (server, server_storage) = node(true, "server");
        let (client, client_storage) = node(false, "client");

        server.start_server(Arc::new(acceptor), None);
        client.start_client(vec![Arc::new(connector)]);

        server_storage
            .set_entry_value("/speed", Value::Double(3.25))
            .unwrap();
        server.flush();

        wait_for(|| client_storage.get_entry_value("/speed") == Some(Value::Double(3.25))).await;

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_value_reaches_server() {
        let (connector, acceptor) = memory::link();
        let (server, server_storage) = node(true, "server");
        let (client, client_storage) = node(false, "client");

        server.start_server(Arc::new(acceptor), None);
        client.start_client(vec![Arc::new(connector)]);

        wait_for(|| !client.get_connections().is_empty()).await;
        client_storage
            .set_entry_value("/arm", Value::Boolean(true))
            .unwrap();
        client.flush();

        wait_for(|| server_storage.get_entry_value("/arm") == Some(Value::Boolean(true))).await;

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_listed_then_removed() {
        let (connector, acceptor) = memory::link();
        let (server, _) = node(true, "server");
        let (client, _) = node(false, "client");

        server.start_server(Arc::new(acceptor), None);
        client.start_client(vec![Arc::new(connector)]);

        wait_for(|| server.get_connections().len() == 1).await;
        assert_eq!(server.get_connections()[0].remote_id, "client");

        client.stop().await;
        wait_for(|| server.get_connections().is_empty()).await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_redials_after_connection_death() {
        let (connector, acceptor) = memory::link();
        let (server, server_storage) = node(true, "server");
        let (client, client_storage) = node(false, "client");

        server.start_server(Arc::new(acceptor), None);
        client.start_client(vec![Arc::new(connector)]);

        server_storage
            .set_entry_value("/v", Value::Double(1.0))
            .unwrap();
        server.flush();
        wait_for(|| client_storage.get_entry_value("/v") == Some(Value::Double(1.0))).await;

        // kill the live stream from the server side, both nodes stay up
        let conn = server
            .connections
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .next()
            .cloned();
        if let Some(conn) = conn {
            conn.close();
        }
        wait_for(|| server.get_connections().is_empty()).await;

        // reconnect loop redials on its own and resynchronizes
        wait_for(|| {
            server.get_connections().len() == 1 && client.get_connections().len() == 1
        })
        .await;

        server_storage
            .set_entry_value("/v", Value::Double(2.0))
            .unwrap();
        server.flush();
        wait_for(|| client_storage.get_entry_value("/v") == Some(Value::Double(2.0))).await;
        assert_eq!(client_storage.get_entry_info("", None).len(), 1);

        client.stop().await;
        server.stop().await;
    }
}
