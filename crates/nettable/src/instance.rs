//! The Instance: unified API for one node of the replicated table.
//!
//! An instance bundles the entry table, the notifier and the
//! dispatcher behind one handle. It is built in either server or
//! client role; the role fixes who arbitrates entry ids and cannot
//! change for the instance's lifetime.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nettable_core::{
    ConnectionCallback, ConnectionInfo, EntryCallback, EntryFlags, EntryInfo, ListenerId,
    Notifier, Value, ValueType,
};
use nettable_net::{Acceptor, Connector, Dispatcher, TcpAcceptor, TcpConnector};
use nettable_store::Storage;
use tracing::info;

use crate::error::{Error, Result};

/// How long a TCP connect attempt may take before the next server in
/// the list is tried.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for an [`Instance`].
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Identity string sent to peers during the handshake.
    pub identity: String,
    /// How often queued changes are flushed onto the wire. Clamped to
    /// [100ms, 1000ms].
    pub update_rate: Duration,
    /// Server only: file backing entries flagged persistent.
    pub persist_path: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            identity: "nettable".to_owned(),
            update_rate: Duration::from_millis(100),
            persist_path: None,
        }
    }
}

/// One node of the replicated table.
pub struct Instance {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    dispatcher: Arc<Dispatcher>,
    server: bool,
    persist_path: Option<PathBuf>,
}

impl Instance {
    /// Build a server-role instance. The server owns id assignment and
    /// its table survives client churn.
    pub fn server(config: InstanceConfig) -> Self {
        Self::build(true, config)
    }

    /// Build a client-role instance.
    pub fn client(config: InstanceConfig) -> Self {
        Self::build(false, config)
    }

    fn build(server: bool, config: InstanceConfig) -> Self {
        let notifier = Arc::new(Notifier::new());
        let storage = Arc::new(Storage::new(server, Arc::clone(&notifier)));
        let dispatcher = Dispatcher::new(
            server,
            config.identity,
            Arc::clone(&storage),
            Arc::clone(&notifier),
        );
        dispatcher.set_update_rate(config.update_rate);
        Self {
            storage,
            notifier,
            dispatcher,
            server,
            persist_path: config.persist_path,
        }
    }

    // ---- lifecycle ------------------------------------------------

    /// Bind a TCP listener and start serving. Returns the bound
    /// address, useful with port 0.
    pub async fn start_server(&self, bind_addr: &str) -> Result<SocketAddr> {
        let acceptor = TcpAcceptor::bind(bind_addr).await?;
        let addr = acceptor.local_addr()?;
        self.start_server_with(Arc::new(acceptor))?;
        Ok(addr)
    }

    /// Start serving on a caller-supplied transport.
    pub fn start_server_with(&self, acceptor: Arc<dyn Acceptor>) -> Result<()> {
        if !self.server {
            return Err(Error::InvalidState("client instance cannot serve"));
        }
        info!("starting server instance");
        self.dispatcher
            .start_server(acceptor, self.persist_path.clone());
        Ok(())
    }

    /// Start dialing `servers` (host:port) round-robin until one
    /// answers, reconnecting forever.
    pub fn start_client<S: AsRef<str>>(&self, servers: &[S]) -> Result<()> {
        let connectors = servers
            .iter()
            .map(|addr| {
                Arc::new(TcpConnector::new(addr.as_ref(), CONNECT_TIMEOUT)) as Arc<dyn Connector>
            })
            .collect();
        self.start_client_with(connectors)
    }

    /// Start dialing caller-supplied transports.
    pub fn start_client_with(&self, connectors: Vec<Arc<dyn Connector>>) -> Result<()> {
        if self.server {
            return Err(Error::InvalidState("server instance cannot dial out"));
        }
        info!("starting client instance");
        self.dispatcher.start_client(connectors);
        Ok(())
    }

    /// Stop all networking, close every connection, and (server) write
    /// a final persistence save.
    pub async fn stop(&self) {
        info!("stopping instance");
        self.dispatcher.stop().await;
    }

    // ---- values ---------------------------------------------------

    /// Set an entry's value, creating it if absent. Fails if the entry
    /// exists with a different type.
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        Ok(self.storage.set_entry_value(name, value.into())?)
    }

    /// Set an entry's value, replacing the entry if the type differs.
    pub fn force_set_value(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        Ok(self.storage.set_entry_type_value(name, value.into())?)
    }

    pub fn get_value(&self, name: &str) -> Option<Value> {
        self.storage.get_entry_value(name)
    }

    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        self.get_value(name).and_then(|v| v.as_boolean())
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.get_value(name).and_then(|v| v.as_double())
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get_value(name)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn delete(&self, name: &str) {
        self.storage.delete_entry(name);
    }

    /// Delete every entry on every synchronized node.
    pub fn delete_all(&self) {
        self.storage.delete_all_entries();
    }

    pub fn set_flags(&self, name: &str, flags: EntryFlags) {
        self.storage.set_entry_flags(name, flags);
    }

    pub fn get_flags(&self, name: &str) -> EntryFlags {
        self.storage.get_entry_flags(name)
    }

    /// Mark an entry to survive server restarts.
    pub fn set_persistent(&self, name: &str) {
        let flags = self.get_flags(name) | EntryFlags::PERSISTENT;
        self.set_flags(name, flags);
    }

    pub fn clear_persistent(&self, name: &str) {
        let flags = self.get_flags(name);
        if flags.is_persistent() {
            self.set_flags(name, EntryFlags::from_bits(flags.bits() & !EntryFlags::PERSISTENT.bits()));
        }
    }

    /// Entries whose names start with `prefix`, optionally filtered by
    /// type, sorted by name.
    pub fn get_entries(&self, prefix: &str, ty: Option<ValueType>) -> Vec<EntryInfo> {
        self.storage.get_entry_info(prefix, ty)
    }

    // ---- listeners ------------------------------------------------

    /// Register an entry listener for names under `prefix`.
    /// `notify_flags` is a mask of [`nettable_core::notify_flags`] bits.
    pub fn add_entry_listener(
        &self,
        prefix: &str,
        notify_flags: u32,
        callback: EntryCallback,
    ) -> ListenerId {
        self.notifier.add_entry_listener(prefix, notify_flags, callback)
    }

    pub fn remove_entry_listener(&self, id: ListenerId) {
        self.notifier.remove_entry_listener(id);
    }

    /// Register a connection listener. With `immediate` set, a
    /// connected notification is replayed for every current peer.
    pub fn add_connection_listener(
        &self,
        callback: ConnectionCallback,
        immediate: bool,
    ) -> ListenerId {
        let id = self.notifier.add_connection_listener(callback);
        if immediate {
            self.dispatcher.notify_connections();
        }
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) {
        self.notifier.remove_connection_listener(id);
    }

    // ---- network --------------------------------------------------

    /// Push everything queued onto the wire now, without waiting for
    /// the next tick.
    pub fn flush(&self) {
        self.dispatcher.flush();
    }

    pub fn set_update_rate(&self, interval: Duration) {
        self.dispatcher.set_update_rate(interval);
    }

    /// Change the identity announced to peers in future handshakes.
    pub fn set_identity(&self, identity: &str) {
        self.dispatcher.set_identity(identity);
    }

    /// Snapshot of every synchronized peer.
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.dispatcher.get_connections()
    }

    pub fn is_connected(&self) -> bool {
        !self.get_connections().is_empty()
    }

    // ---- persistence ----------------------------------------------

    /// Write persistent entries to `path` immediately, outside the
    /// dispatcher's save cadence.
    pub fn save_persistent(&self, path: &Path) -> Result<()> {
        Ok(self.storage.save_persistent(path)?)
    }

    /// Load entries from `path`, marking each persistent. Returns
    /// (line, reason) warnings for lines that were skipped.
    pub fn load_persistent(&self, path: &Path) -> Result<Vec<(usize, String)>> {
        Ok(self.storage.load_persistent(path)?)
    }
}
