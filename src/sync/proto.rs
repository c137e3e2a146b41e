//! Wire message schemas and JSON encoding.
//!
//! Two message kinds, discriminated by position in the stream: the first
//! frame in each direction is a handshake, every later frame is a
//! changeset. There is no type tag; the session tracks position.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::{Changeset, Hlc, NodeId};

/// Standard WebSocket close codes the engine emits. Codes from the peer are
/// passed through transparently; no new codes are defined.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_ABNORMAL: u16 = 1006;

/// First frame in each direction.
///
/// `last_modified` is the sender's high-water mark over records the
/// *receiver* is expected to provide (see the session handshake rules).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: NodeId,
    pub last_modified: Hlc,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed handshake: {0}")]
    Handshake(#[source] serde_json::Error),
    #[error("malformed changeset: {0}")]
    Changeset(#[source] serde_json::Error),
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

pub fn encode_handshake(handshake: &Handshake) -> Result<String, ProtoError> {
    serde_json::to_string(handshake).map_err(ProtoError::Encode)
}

pub fn decode_handshake(text: &str) -> Result<Handshake, ProtoError> {
    serde_json::from_str(text).map_err(ProtoError::Handshake)
}

pub fn encode_changeset(changeset: &Changeset) -> Result<String, ProtoError> {
    serde_json::to_string(changeset).map_err(ProtoError::Encode)
}

pub fn decode_changeset(text: &str) -> Result<Changeset, ProtoError> {
    serde_json::from_str(text).map_err(ProtoError::Changeset)
}
