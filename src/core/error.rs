//! Core validation errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid node id: {reason}")]
    InvalidNodeId { reason: String },
    #[error("invalid hlc {raw:?}: {reason}")]
    InvalidHlc { raw: String, reason: String },
}
