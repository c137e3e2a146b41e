//! Engine error taxonomy.
//!
//! Protocol errors close the connection; transport errors become
//! disconnects; store errors during merge are logged and survived (the
//! peer's high-water mark replays the loss on reconnect). `SyncError`
//! unifies the kinds: the session converts one into its close code, and
//! fallible public surfaces return it.

use thiserror::Error;

use crate::core::CoreError;

use super::proto::ProtoError;

/// Failures raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("changeset query failed: {reason}")]
    Query { reason: String },
    #[error("merge rejected: {reason}")]
    Merge { reason: String },
}

/// Failures raised by a message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },
    #[error("frame payload is not utf-8")]
    NotText,
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SyncError {
    /// Whether the fault lies with the peer's frames (close 1002) rather
    /// than with this side (close 1011).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol { .. }
                | SyncError::Core(_)
                | SyncError::Proto(ProtoError::Handshake(_) | ProtoError::Changeset(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_faults_are_protocol_errors() {
        let malformed = crate::sync::proto::decode_handshake("not json").unwrap_err();
        assert!(SyncError::from(malformed).is_protocol());
        assert!(
            SyncError::Protocol {
                reason: "changeset before handshake".into()
            }
            .is_protocol()
        );
        let local = SyncError::from(StoreError::Query {
            reason: "disk gone".into(),
        });
        assert!(!local.is_protocol());
    }
}
