//! The synchronization engine: codec, session, transports, registry,
//! reconnect controller.

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod error;
pub mod memory;
pub mod proto;
pub mod query;
pub mod server;
pub mod session;
pub mod store;
pub mod tcp;

pub use broadcast::{ChangeBroadcaster, ChangeSubscription};
pub use channel::{ChannelEvent, ChannelHandle, ChannelSink, memory_pair};
pub use client::{ClientStatus, SyncClient};
pub use error::{ChannelError, StoreError, SyncError};
pub use memory::MemoryStore;
pub use proto::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, Handshake, ProtoError,
};
pub use query::table_query;
pub use server::{SyncServer, SyncServerHandle};
pub use session::{
    HandshakeData, Peer, Session, SessionAction, SessionConfig, SessionHooks, SessionOutcome,
    SessionPhase, SessionRole, drive,
};
pub use store::{ChangesetQuery, ModifiedFilter, NodeFilter, SyncStore};
