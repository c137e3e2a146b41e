//! Per-connection synchronization session.
//!
//! The protocol state machine is IO-free: every input (`start`, an inbound
//! frame, a change-stream event, channel closure) returns the actions the
//! driver must apply. `drive` owns the event loop, the change-stream
//! subscription, and the lifecycle callbacks.
//!
//! Handshake rules: the client sends first and advertises
//! `last_modified(Except(local))`, the high-water mark of records it did
//! not author, exactly the set the server provides. The server replies with
//! `last_modified(Only(remote))`, the highest timestamp it holds that
//! originated at that client. Each side then sends what the other is
//! missing, filtered so a record never echoes back to its author.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crossbeam::channel::never;
use serde_json::Value;

use crate::core::{Hlc, NodeId, Record, TableChange};

use super::channel::{ChannelEvent, ChannelHandle};
use super::error::SyncError;
use super::proto::{
    self, CLOSE_PROTOCOL_ERROR, Handshake, encode_changeset, encode_handshake,
};
use super::store::{ChangesetQuery, ModifiedFilter, NodeFilter, SyncStore};

/// Internal-error close code (standard WebSocket 1011).
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHandshake,
    Syncing,
    Closed,
}

/// The remote side, known once its handshake arrives.
#[derive(Clone, Debug)]
pub struct Peer {
    pub node_id: NodeId,
    pub last_modified: Hlc,
    pub data: Option<Value>,
}

pub type ValidateRecord = dyn Fn(&NodeId, &str, &Record) -> bool + Send + Sync;
pub type MapRecord = dyn Fn(&str, Record) -> Record + Send + Sync;
pub type ConnectHook = dyn Fn(&NodeId, Option<&Value>) + Send + Sync;
pub type DisconnectHook = dyn Fn(&NodeId, Option<u16>, Option<&str>) + Send + Sync;
pub type ChangesetHook = dyn Fn(&NodeId, &BTreeMap<String, usize>) + Send + Sync;

/// Handshake `data` builder. Exactly one variant fits each role: the client
/// variant takes no arguments; the server variant may inspect the client's
/// id and data before replying.
pub enum HandshakeData {
    Client(Box<dyn Fn() -> Option<Value> + Send + Sync>),
    Server(Box<dyn Fn(&NodeId, Option<&Value>) -> Option<Value> + Send + Sync>),
}

/// Application callbacks. All optional; a panicking hook is logged and the
/// session carries on.
#[derive(Default)]
pub struct SessionHooks {
    /// Record-level admission. `false` drops the record silently.
    pub validate_record: Option<Box<ValidateRecord>>,
    /// Pure per-record transformation of validated incoming records.
    pub map_incoming: Option<Box<MapRecord>>,
    pub on_connect: Option<Box<ConnectHook>>,
    pub on_disconnect: Option<Box<DisconnectHook>>,
    pub on_changeset_received: Option<Box<ChangesetHook>>,
    pub on_changeset_sent: Option<Box<ChangesetHook>>,
    pub handshake_data: Option<HandshakeData>,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub role: SessionRole,
    /// Restrict syncing to these tables; `None` means all tables.
    pub tables: Option<BTreeSet<String>>,
    /// Custom per-table SQL passed through to SQL-shaped stores.
    pub queries: BTreeMap<String, String>,
    pub verbose: bool,
}

impl SessionConfig {
    pub fn client() -> Self {
        Self::new(SessionRole::Client)
    }

    pub fn server() -> Self {
        Self::new(SessionRole::Server)
    }

    fn new(role: SessionRole) -> Self {
        Self {
            role,
            tables: None,
            queries: BTreeMap::new(),
            verbose: false,
        }
    }

    pub fn with_tables(mut self, tables: BTreeSet<String>) -> Self {
        self.tables = Some(tables);
        self
    }
}

/// What the driver must do with the transport or lifecycle after an input.
#[derive(Debug)]
pub enum SessionAction {
    Send(String),
    Close { code: u16, reason: String },
    /// Handshake completed in both directions.
    Connected,
    /// Terminal. Emitted at most once, only after `Connected`.
    Disconnected {
        code: Option<u16>,
        reason: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Syncing,
    Closed,
}

pub struct Session {
    config: SessionConfig,
    hooks: Arc<SessionHooks>,
    local: NodeId,
    state: State,
    handshake_sent: bool,
    peer: Option<Peer>,
    connected: bool,
    disconnect_delivered: bool,
}

impl Session {
    /// Panics if a handshake-data builder for the opposite role is supplied;
    /// that is a programming error, not a runtime condition.
    pub fn new(local: NodeId, config: SessionConfig, hooks: Arc<SessionHooks>) -> Self {
        match (&config.role, &hooks.handshake_data) {
            (SessionRole::Client, Some(HandshakeData::Server(_))) => {
                panic!("server handshake builder supplied to a client session")
            }
            (SessionRole::Server, Some(HandshakeData::Client(_))) => {
                panic!("client handshake builder supplied to a server session")
            }
            _ => {}
        }
        Self {
            config,
            hooks,
            local,
            state: State::AwaitingHandshake,
            handshake_sent: false,
            peer: None,
            connected: false,
            disconnect_delivered: false,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.config.role
    }

    pub fn phase(&self) -> SessionPhase {
        match self.state {
            State::AwaitingHandshake => SessionPhase::AwaitingHandshake,
            State::Syncing => SessionPhase::Syncing,
            State::Closed => SessionPhase::Closed,
        }
    }

    /// Readable only after the incoming handshake.
    pub fn remote_node_id(&self) -> Option<&NodeId> {
        self.peer.as_ref().map(|peer| &peer.node_id)
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    pub(crate) fn hooks(&self) -> &Arc<SessionHooks> {
        &self.hooks
    }

    /// First input. The client sends its handshake; the server waits.
    pub fn start(&mut self, store: &impl SyncStore) -> Vec<SessionAction> {
        if self.config.role != SessionRole::Client || self.state != State::AwaitingHandshake {
            return Vec::new();
        }
        match self.try_start(store) {
            Ok(actions) => actions,
            Err(err) => self.close_on(err),
        }
    }

    fn try_start(&mut self, store: &impl SyncStore) -> Result<Vec<SessionAction>, SyncError> {
        // The peer already holds everything we authored; advertise the
        // high-water mark over everyone else's records.
        let last_modified = store.last_modified(&NodeFilter::Except(self.local.clone()))?;
        let data = match &self.hooks.handshake_data {
            Some(HandshakeData::Client(build)) => build(),
            _ => None,
        };
        self.send_handshake(last_modified, data)
    }

    pub fn handle_frame(&mut self, text: &str, store: &impl SyncStore) -> Vec<SessionAction> {
        match self.state {
            State::Closed => Vec::new(),
            State::AwaitingHandshake => self.handle_handshake_frame(text, store),
            State::Syncing => self.handle_changeset_frame(text, store),
        }
    }

    /// One change-stream event: forward the matching delta, if any.
    pub fn handle_change(
        &mut self,
        change: &TableChange,
        store: &impl SyncStore,
    ) -> Vec<SessionAction> {
        if self.state != State::Syncing {
            return Vec::new();
        }
        let tables: BTreeSet<String> = match &self.config.tables {
            Some(allowed) => change.tables.intersection(allowed).cloned().collect(),
            None => change.tables.clone(),
        };
        if tables.is_empty() {
            return Vec::new();
        }
        match self.send_changeset(store, tables, ModifiedFilter::On(change.hlc.clone())) {
            Ok(actions) => actions,
            Err(err) => self.close_on(err),
        }
    }

    /// Initial catch-up: everything past the peer's advertised high-water
    /// mark. The driver installs the change subscription *before* calling
    /// this, so a write landing during the build is delivered twice rather
    /// than never.
    pub fn begin_sync(&mut self, store: &impl SyncStore) -> Vec<SessionAction> {
        if self.state != State::Syncing {
            return Vec::new();
        }
        let Some(peer) = &self.peer else {
            return Vec::new();
        };
        let since = peer.last_modified.clone();
        let tables = self
            .config
            .tables
            .clone()
            .unwrap_or_else(|| store.tables());
        match self.send_changeset(store, tables, ModifiedFilter::After(since)) {
            Ok(actions) => actions,
            Err(err) => self.close_on(err),
        }
    }

    /// Channel teardown. Idempotent; `Disconnected` is emitted exactly once
    /// and only if the handshake had completed.
    pub fn handle_closed(
        &mut self,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> Vec<SessionAction> {
        self.state = State::Closed;
        if !self.connected || self.disconnect_delivered {
            return Vec::new();
        }
        self.disconnect_delivered = true;
        vec![SessionAction::Disconnected {
            code,
            reason: reason.map(str::to_string),
        }]
    }

    fn handle_handshake_frame(
        &mut self,
        text: &str,
        store: &impl SyncStore,
    ) -> Vec<SessionAction> {
        match self.try_handshake_frame(text, store) {
            Ok(actions) => actions,
            Err(err) => self.close_on(err),
        }
    }

    fn try_handshake_frame(
        &mut self,
        text: &str,
        store: &impl SyncStore,
    ) -> Result<Vec<SessionAction>, SyncError> {
        let handshake = proto::decode_handshake(text)?;
        if handshake.node_id.as_str().is_empty() {
            return Err(SyncError::Protocol {
                reason: "handshake without a node id".to_string(),
            });
        }
        // Skew guard on the time components only; the node id field of a
        // high-water mark is not comparable across stores.
        let canonical = store.canonical_time();
        let advertised = &handshake.last_modified;
        if (advertised.millis(), advertised.counter()) > (canonical.millis(), canonical.counter()) {
            tracing::warn!(
                target: "sync",
                peer = %handshake.node_id,
                advertised = %advertised,
                "peer advertised a high-water mark ahead of our canonical time"
            );
        }
        let peer = Peer {
            node_id: handshake.node_id,
            last_modified: handshake.last_modified.apply(self.local.clone()),
            data: handshake.data,
        };

        let mut actions = Vec::new();
        if self.config.role == SessionRole::Server {
            // We are the aggregator; the client is the authority for its own
            // rows. Advertise the highest timestamp that originated there.
            let last_modified = store.last_modified(&NodeFilter::Only(peer.node_id.clone()))?;
            let data = match &self.hooks.handshake_data {
                Some(HandshakeData::Server(build)) => {
                    build(&peer.node_id, peer.data.as_ref())
                }
                _ => None,
            };
            self.peer = Some(peer);
            actions.extend(self.send_handshake(last_modified, data)?);
        } else {
            self.peer = Some(peer);
        }

        if self.handshake_sent && self.state == State::AwaitingHandshake {
            self.state = State::Syncing;
            self.connected = true;
            if self.config.verbose
                && let Some(peer) = &self.peer
            {
                tracing::debug!(
                    target: "sync",
                    peer = %peer.node_id,
                    role = ?self.config.role,
                    "handshake complete"
                );
            }
            actions.push(SessionAction::Connected);
        }
        Ok(actions)
    }

    fn handle_changeset_frame(
        &mut self,
        text: &str,
        store: &impl SyncStore,
    ) -> Vec<SessionAction> {
        match self.try_changeset_frame(text, store) {
            Ok(actions) => actions,
            Err(err) => self.close_on(err),
        }
    }

    fn try_changeset_frame(
        &mut self,
        text: &str,
        store: &impl SyncStore,
    ) -> Result<Vec<SessionAction>, SyncError> {
        let mut changeset = proto::decode_changeset(text)?;
        let Some(peer_id) = self.remote_node_id().cloned() else {
            return Err(SyncError::Protocol {
                reason: "changeset before handshake".to_string(),
            });
        };

        // A table-scoped session ignores traffic outside its scope in both
        // directions.
        if let Some(allowed) = &self.config.tables {
            changeset.0.retain(|table, _| allowed.contains(table));
            if changeset.is_empty() {
                return Ok(Vec::new());
            }
        }

        // Localize every timestamp's node id so per-peer high-water marks
        // stay coherent even for records relayed through other peers. Time
        // components are never rewritten.
        for records in changeset.0.values_mut() {
            for record in records.iter_mut() {
                let modified = record.modified()?;
                record.set_modified(&modified.apply(self.local.clone()));
            }
        }

        if let Some(validate) = &self.hooks.validate_record {
            for (table, records) in changeset.0.iter_mut() {
                records.retain(|record| {
                    guard_hook("validate_record", || validate(&peer_id, table, record))
                        .unwrap_or(false)
                });
            }
            changeset.prune_empty();
        }

        if let Some(map) = &self.hooks.map_incoming {
            for (table, records) in changeset.0.iter_mut() {
                for record in records.iter_mut() {
                    let mapped = std::mem::take(record);
                    *record = guard_hook("map_incoming", || map(table, mapped.clone()))
                        .unwrap_or(mapped);
                }
            }
        }

        if changeset.is_empty() {
            return Ok(Vec::new());
        }

        let counts = changeset.counts();
        if let Some(hook) = &self.hooks.on_changeset_received {
            guard_hook("on_changeset_received", || hook(&peer_id, &counts));
        }
        if self.config.verbose {
            tracing::debug!(target: "sync", peer = %peer_id, counts = ?counts, "changeset received");
        }

        if let Err(err) = store.merge(changeset) {
            // The peer's high-water mark replays this on reconnect; the
            // session stays up.
            tracing::error!(target: "sync", peer = %peer_id, error = %err, "merge failed");
        }
        Ok(Vec::new())
    }

    fn send_handshake(
        &mut self,
        last_modified: Hlc,
        data: Option<Value>,
    ) -> Result<Vec<SessionAction>, SyncError> {
        let handshake = Handshake {
            node_id: self.local.clone(),
            last_modified,
            data,
        };
        let text = encode_handshake(&handshake)?;
        self.handshake_sent = true;
        Ok(vec![SessionAction::Send(text)])
    }

    fn send_changeset(
        &mut self,
        store: &impl SyncStore,
        tables: BTreeSet<String>,
        modified: ModifiedFilter,
    ) -> Result<Vec<SessionAction>, SyncError> {
        let Some(peer_id) = self.remote_node_id().cloned() else {
            return Ok(Vec::new());
        };
        let node = match self.config.role {
            // A client only ever sends records it authored.
            SessionRole::Client => NodeFilter::Only(self.local.clone()),
            // A server sends everything except what the client itself
            // authored, which the client already has.
            SessionRole::Server => NodeFilter::Except(peer_id.clone()),
        };
        let mut query = ChangesetQuery::new(node, modified).with_tables(tables);
        query.queries = self.config.queries.clone();

        let changeset = match store.changeset(&query) {
            Ok(changeset) => changeset,
            Err(err) => {
                // The peer requests what it missed on reconnect; a failed
                // build does not end the session.
                tracing::error!(target: "sync", peer = %peer_id, error = %err, "changeset build failed");
                return Ok(Vec::new());
            }
        };
        if changeset.is_empty() {
            return Ok(Vec::new());
        }

        let counts = changeset.counts();
        if let Some(hook) = &self.hooks.on_changeset_sent {
            guard_hook("on_changeset_sent", || hook(&peer_id, &counts));
        }
        if self.config.verbose {
            tracing::debug!(target: "sync", peer = %peer_id, counts = ?counts, "changeset sent");
        }

        let text = encode_changeset(&changeset)?;
        Ok(vec![SessionAction::Send(text)])
    }

    /// Convert a failure into the matching close action.
    fn close_on(&mut self, err: SyncError) -> Vec<SessionAction> {
        let code = if err.is_protocol() {
            tracing::warn!(target: "sync", error = %err, "protocol error; closing");
            CLOSE_PROTOCOL_ERROR
        } else {
            tracing::error!(target: "sync", error = %err, "internal error; closing");
            CLOSE_INTERNAL
        };
        self.state = State::Closed;
        vec![SessionAction::Close {
            code,
            reason: err.to_string(),
        }]
    }
}

/// Run a hook, surviving a panic inside it.
fn guard_hook<T>(name: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(target: "sync", hook = name, "application hook panicked");
            None
        }
    }
}

/// Outcome of a driven session, for the owning registry or controller.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Set iff the handshake completed.
    pub peer: Option<NodeId>,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
}

/// Own a session's event loop until the channel closes.
///
/// `on_connected` runs after the handshake completes and the change
/// subscription is installed, before the catch-up changeset is sent;
/// registry insertion and backoff reset happen there. `on_disconnected`
/// runs once, after the user hook, iff the handshake had completed.
pub fn drive<S: SyncStore>(
    mut session: Session,
    channel: ChannelHandle,
    store: &S,
    mut on_connected: impl FnMut(&NodeId),
    mut on_disconnected: impl FnMut(&NodeId),
) -> SessionOutcome {
    let hooks = Arc::clone(session.hooks());
    // The subscription exists for the whole session: events arriving before
    // the handshake completes are ignored (their writes fall inside the
    // catch-up window), and anything after the catch-up snapshot is
    // delivered live. A write landing in between arrives twice, never zero
    // times.
    let mut changes = store.subscribe().into_receiver();
    let mut outcome = SessionOutcome {
        peer: None,
        close_code: None,
        close_reason: None,
    };

    let mut queue: VecDeque<SessionAction> = session.start(store).into();
    let mut store_stream_gone = false;

    loop {
        if store_stream_gone {
            // The store dropped its broadcaster; park this arm and let the
            // channel closure end the session.
            changes = never::<TableChange>();
            store_stream_gone = false;
        }
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Send(text) => {
                    if let Err(err) = channel.sink.send(&text) {
                        tracing::warn!(target: "sync", error = %err, "send failed");
                    }
                }
                SessionAction::Close { code, reason } => {
                    channel.sink.close(Some(code), Some(&reason));
                }
                SessionAction::Connected => {
                    let peer = session
                        .peer()
                        .cloned()
                        .expect("connected session has a peer");
                    outcome.peer = Some(peer.node_id.clone());
                    on_connected(&peer.node_id);
                    if let Some(hook) = &hooks.on_connect {
                        guard_hook("on_connect", || {
                            hook(&peer.node_id, peer.data.as_ref())
                        });
                    }
                    queue.extend(session.begin_sync(store));
                }
                SessionAction::Disconnected { code, reason } => {
                    let peer = outcome
                        .peer
                        .clone()
                        .expect("disconnect only after connect");
                    if let Some(hook) = &hooks.on_disconnect {
                        guard_hook("on_disconnect", || {
                            hook(&peer, code, reason.as_deref())
                        });
                    }
                    on_disconnected(&peer);
                    outcome.close_code = code;
                    outcome.close_reason = reason;
                    return outcome;
                }
            }
        }

        let actions = crossbeam::select! {
            recv(channel.events) -> event => match event {
                Ok(ChannelEvent::Frame(text)) => session.handle_frame(&text, store),
                Ok(ChannelEvent::Error(err)) => {
                    // The transport decides terminal-vs-transient; a
                    // terminal fault is followed by `Closed`.
                    tracing::warn!(target: "sync", error = %err, "channel error");
                    Vec::new()
                }
                Ok(ChannelEvent::Closed { code, reason }) => {
                    outcome.close_code = code;
                    outcome.close_reason = reason.clone();
                    let actions = session.handle_closed(code, reason.as_deref());
                    if actions.is_empty() {
                        return outcome;
                    }
                    actions
                }
                Err(_) => {
                    let actions = session.handle_closed(None, None);
                    if actions.is_empty() {
                        return outcome;
                    }
                    actions
                }
            },
            recv(changes) -> change => match change {
                Ok(change) => session.handle_change(&change, store),
                Err(_) => {
                    store_stream_gone = true;
                    Vec::new()
                }
            },
        };
        queue.extend(actions);
    }
}
