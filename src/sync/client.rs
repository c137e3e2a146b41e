//! Client-side reconnect controller.
//!
//! Owns one session at a time. While online mode holds, every drop of the
//! connection schedules a retry after the current backoff delay, which
//! doubles from 2 s up to a 10 s cap and resets on a completed handshake.
//! An explicit disconnect leaves online mode and is terminal until the next
//! `connect`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::config::SyncConfig;

use super::channel::ChannelSink;
use super::proto::CLOSE_NORMAL;
use super::session::{Session, SessionConfig, SessionHooks, drive};
use super::store::SyncStore;
use super::tcp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect delay. The minimum is 2 s (1 s would not grow
/// under doubling) and the cap keeps a long-down server from being hammered.
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

struct ClientShared {
    status: Mutex<ClientStatus>,
    watchers: Mutex<Vec<Sender<ClientStatus>>>,
    online: AtomicBool,
    active: Mutex<Option<Arc<dyn ChannelSink>>>,
}

impl ClientShared {
    fn set_status(&self, status: ClientStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .retain(|tx| tx.send(status).is_ok());
    }
}

pub struct SyncClient<S> {
    addr: String,
    store: Arc<S>,
    config: SyncConfig,
    hooks: Arc<SessionHooks>,
    session_template: SessionConfig,
    shared: Arc<ClientShared>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl<S> SyncClient<S>
where
    S: SyncStore + 'static,
{
    pub fn new(
        addr: impl Into<String>,
        store: Arc<S>,
        config: SyncConfig,
        hooks: SessionHooks,
    ) -> Self {
        let mut session_template = SessionConfig::client();
        session_template.verbose = config.verbose;
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            addr: addr.into(),
            store,
            config,
            hooks: Arc::new(hooks),
            session_template,
            shared: Arc::new(ClientShared {
                status: Mutex::new(ClientStatus::Disconnected),
                watchers: Mutex::new(Vec::new()),
                online: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
            wake_tx,
            wake_rx,
            controller: Mutex::new(None),
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

    pub fn status(&self) -> ClientStatus {
        *self.shared.status.lock().expect("status lock poisoned")
    }

    /// Broadcast stream of status transitions.
    pub fn subscribe_status(&self) -> Receiver<ClientStatus> {
        let (tx, rx) = unbounded();
        self.shared
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(tx);
        rx
    }

    /// Enter online mode and start connecting. No-op while a previous
    /// `connect` is still in force, whatever phase it is in.
    pub fn connect(&self) {
        if self.shared.online.swap(true, Ordering::AcqRel) {
            return;
        }
        // The previous controller has been told to stop; reap it.
        if let Some(done) = self.controller.lock().expect("controller lock poisoned").take() {
            let _ = done.join();
        }
        // Drain a stale wakeup from a previous disconnect.
        let _ = self.wake_rx.try_recv();

        let runtime = ControllerRuntime {
            addr: self.addr.clone(),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            hooks: Arc::clone(&self.hooks),
            session_template: self.session_template.clone(),
            shared: Arc::clone(&self.shared),
            wake_rx: self.wake_rx.clone(),
        };
        let join = thread::spawn(move || run_controller(runtime));
        *self.controller.lock().expect("controller lock poisoned") = Some(join);
    }

    /// Leave online mode, cancel any pending reconnect, close the session.
    /// Blocks until the controller has fully stopped.
    pub fn disconnect(&self, code: Option<u16>, reason: Option<&str>) {
        self.shared.online.store(false, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        if let Some(sink) = self
            .shared
            .active
            .lock()
            .expect("active lock poisoned")
            .take()
        {
            sink.close(code.or(Some(CLOSE_NORMAL)), reason);
        }
        let handle = self.controller.lock().expect("controller lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl<S> Drop for SyncClient<S> {
    fn drop(&mut self) {
        self.shared.online.store(false, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        if let Some(sink) = self
            .shared
            .active
            .lock()
            .expect("active lock poisoned")
            .take()
        {
            sink.close(Some(CLOSE_NORMAL), Some("client dropped"));
        }
    }
}

struct ControllerRuntime<S> {
    addr: String,
    store: Arc<S>,
    config: SyncConfig,
    hooks: Arc<SessionHooks>,
    session_template: SessionConfig,
    shared: Arc<ClientShared>,
    wake_rx: Receiver<()>,
}

fn run_controller<S>(runtime: ControllerRuntime<S>)
where
    S: SyncStore,
{
    let mut backoff = Backoff::new(
        Duration::from_secs(runtime.config.reconnect_min_secs),
        Duration::from_secs(runtime.config.reconnect_max_secs),
    );

    while runtime.shared.online.load(Ordering::Acquire) {
        runtime.shared.set_status(ClientStatus::Connecting);

        match tcp::connect(&runtime.addr, &runtime.config) {
            Ok(channel) => {
                *runtime.shared.active.lock().expect("active lock poisoned") =
                    Some(Arc::clone(&channel.sink));
                // A disconnect issued while the socket was opening may have
                // missed the sink; honor it now.
                if !runtime.shared.online.load(Ordering::Acquire) {
                    channel.sink.close(Some(CLOSE_NORMAL), Some("client disconnected"));
                }
                let session = Session::new(
                    runtime.store.node_id(),
                    runtime.session_template.clone(),
                    Arc::clone(&runtime.hooks),
                );
                let shared = &runtime.shared;
                drive(
                    session,
                    channel,
                    &*runtime.store,
                    |peer| {
                        tracing::info!(target: "sync", peer = %peer, "connected");
                        backoff.reset();
                        shared.set_status(ClientStatus::Connected);
                    },
                    |peer| {
                        tracing::info!(target: "sync", peer = %peer, "disconnected");
                    },
                );
                runtime
                    .shared
                    .active
                    .lock()
                    .expect("active lock poisoned")
                    .take();
            }
            Err(err) => {
                tracing::warn!(target: "sync", addr = %runtime.addr, error = %err, "connect failed");
            }
        }

        runtime.shared.set_status(ClientStatus::Disconnected);
        if !runtime.shared.online.load(Ordering::Acquire) {
            break;
        }

        let delay = backoff.next_delay();
        tracing::debug!(target: "sync", delay_secs = delay.as_secs(), "reconnect scheduled");
        match runtime.wake_rx.recv_timeout(delay) {
            // Woken by disconnect; the loop condition ends the controller.
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    runtime.shared.set_status(ClientStatus::Disconnected);
}
