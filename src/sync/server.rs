//! Accept loop and live-session registry.
//!
//! Each inbound connection gets its own driver thread. A session enters the
//! registry when its handshake completes and leaves it on disconnect;
//! targeted disconnects close the channel and wait for the driver thread to
//! finish.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, unbounded};

use crate::config::SyncConfig;
use crate::core::NodeId;

use super::channel::ChannelSink;
use super::error::{ChannelError, SyncError};
use super::session::{Session, SessionConfig, SessionHooks, drive};
use super::store::SyncStore;
use super::tcp;

pub type ConnectingHook = dyn Fn(&SocketAddr) + Send + Sync;
pub type UpgradeErrorHook = dyn Fn(&ChannelError, &SocketAddr) + Send + Sync;

struct RegistryEntry {
    node_id: NodeId,
    sink: Arc<dyn ChannelSink>,
    done: Receiver<()>,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<BTreeMap<u64, RegistryEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, id: u64, entry: RegistryEntry) {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .insert(id, entry);
    }

    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|entry| entry.node_id.clone())
            .collect()
    }

    /// Matching sessions' sinks and completion signals.
    fn select(&self, node_id: Option<&NodeId>) -> Vec<(Arc<dyn ChannelSink>, Receiver<()>)> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|entry| node_id.is_none_or(|wanted| &entry.node_id == wanted))
            .map(|entry| (Arc::clone(&entry.sink), entry.done.clone()))
            .collect()
    }
}

pub struct SyncServer<S> {
    listen_addr: String,
    store: Arc<S>,
    config: SyncConfig,
    hooks: Arc<SessionHooks>,
    session_template: SessionConfig,
    on_connecting: Option<Box<ConnectingHook>>,
    on_upgrade_error: Option<Box<UpgradeErrorHook>>,
}

impl<S> SyncServer<S>
where
    S: SyncStore + 'static,
{
    pub fn new(
        listen_addr: impl Into<String>,
        store: Arc<S>,
        config: SyncConfig,
        hooks: SessionHooks,
    ) -> Self {
        let mut session_template = SessionConfig::server();
        session_template.verbose = config.verbose;
        Self {
            listen_addr: listen_addr.into(),
            store,
            config,
            hooks: Arc::new(hooks),
            session_template,
            on_connecting: None,
            on_upgrade_error: None,
        }
    }

    /// Restrict syncing to a subset of tables.
    pub fn with_tables(mut self, tables: BTreeSet<String>) -> Self {
        self.session_template.tables = Some(tables);
        self
    }

    pub fn with_queries(mut self, queries: BTreeMap<String, String>) -> Self {
        self.session_template.queries = queries;
        self
    }

    pub fn on_connecting(mut self, hook: impl Fn(&SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_connecting = Some(Box::new(hook));
        self
    }

    pub fn on_upgrade_error(
        mut self,
        hook: impl Fn(&ChannelError, &SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        self.on_upgrade_error = Some(Box::new(hook));
        self
    }

    pub fn start(self) -> Result<SyncServerHandle, SyncError> {
        let listener = TcpListener::bind(&self.listen_addr).map_err(ChannelError::from)?;
        let local_addr = listener.local_addr().map_err(ChannelError::from)?;
        listener.set_nonblocking(true).map_err(ChannelError::from)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(Registry::default());

        let runtime = AcceptRuntime {
            store: self.store,
            config: self.config,
            hooks: self.hooks,
            session_template: self.session_template,
            on_connecting: self.on_connecting,
            on_upgrade_error: self.on_upgrade_error,
            registry: Arc::clone(&registry),
            shutdown: Arc::clone(&shutdown),
        };
        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(SyncServerHandle {
            shutdown,
            join,
            local_addr,
            registry,
        })
    }
}

pub struct SyncServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
}

impl SyncServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions with a completed handshake.
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.registry.nodes()
    }

    /// Close every session for `node_id`; returns once they have all
    /// terminated.
    pub fn disconnect(&self, node_id: &NodeId, code: Option<u16>, reason: Option<&str>) {
        Self::close_and_wait(self.registry.select(Some(node_id)), code, reason);
    }

    pub fn disconnect_all(&self, code: Option<u16>, reason: Option<&str>) {
        Self::close_and_wait(self.registry.select(None), code, reason);
    }

    /// Stop accepting, drop every live session, join the accept loop.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.disconnect_all(Some(super::proto::CLOSE_NORMAL), Some("server shutdown"));
        let _ = self.join.join();
    }

    fn close_and_wait(
        targets: Vec<(Arc<dyn ChannelSink>, Receiver<()>)>,
        code: Option<u16>,
        reason: Option<&str>,
    ) {
        for (sink, _) in &targets {
            sink.close(code, reason);
        }
        for (_, done) in targets {
            // The driver thread drops its sender on exit.
            let _ = done.recv();
        }
    }
}

struct AcceptRuntime<S> {
    store: Arc<S>,
    config: SyncConfig,
    hooks: Arc<SessionHooks>,
    session_template: SessionConfig,
    on_connecting: Option<Box<ConnectingHook>>,
    on_upgrade_error: Option<Box<UpgradeErrorHook>>,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
}

fn run_accept_loop<S>(listener: TcpListener, runtime: AcceptRuntime<S>)
where
    S: SyncStore + 'static,
{
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                if let Some(hook) = &runtime.on_connecting {
                    hook(&addr);
                }
                let channel = match tcp::accept(stream, &runtime.config) {
                    Ok(channel) => channel,
                    Err(err) => {
                        tracing::warn!(target: "sync", %addr, error = %err, "upgrade failed");
                        if let Some(hook) = &runtime.on_upgrade_error {
                            hook(&err, &addr);
                        }
                        continue;
                    }
                };

                let store = Arc::clone(&runtime.store);
                let hooks = Arc::clone(&runtime.hooks);
                let template = runtime.session_template.clone();
                let registry = Arc::clone(&runtime.registry);
                thread::spawn(move || {
                    run_connection(channel, store, hooks, template, registry);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!(target: "sync", error = %err, "accept error");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn run_connection<S>(
    channel: super::channel::ChannelHandle,
    store: Arc<S>,
    hooks: Arc<SessionHooks>,
    template: SessionConfig,
    registry: Arc<Registry>,
) where
    S: SyncStore,
{
    let session = Session::new(store.node_id(), template, hooks);
    let conn_id = registry.allocate();
    let sink = Arc::clone(&channel.sink);
    let (done_tx, done_rx) = unbounded::<()>();

    let outcome = drive(
        session,
        channel,
        &*store,
        |peer| {
            tracing::info!(target: "sync", peer = %peer, "session connected");
            registry.insert(
                conn_id,
                RegistryEntry {
                    node_id: peer.clone(),
                    sink: Arc::clone(&sink),
                    done: done_rx.clone(),
                },
            );
        },
        |peer| {
            tracing::info!(target: "sync", peer = %peer, "session disconnected");
            registry.remove(conn_id);
        },
    );
    drop(done_tx);

    if outcome.peer.is_none() {
        tracing::debug!(target: "sync", "connection closed before handshake");
    }
}
