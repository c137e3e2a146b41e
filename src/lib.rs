#![forbid(unsafe_code)]

//! tidemark - peer-to-peer delta synchronization for HLC-ordered CRDT
//! stores.
//!
//! Applications write to a local store that is always available; tidemark
//! propagates changes whenever a peer is reachable. Each connection
//! exchanges a handshake carrying the peer's high-water mark, replays the
//! missing window, then streams live deltas. Merge idempotence in the store
//! is the delivery guarantee; the engine never attempts exactly-once.

pub mod config;
pub mod core;
pub mod sync;

pub use config::SyncConfig;
pub use core::{Changeset, CoreError, Hlc, NodeId, Record, TableChange};
pub use sync::{
    ChannelError, ChannelEvent, ChannelHandle, ChannelSink, ChangesetQuery, ClientStatus,
    HandshakeData, MemoryStore, ModifiedFilter, NodeFilter, Session, SessionConfig, SessionHooks,
    StoreError, SyncClient, SyncError, SyncServer, SyncServerHandle, SyncStore,
};
