//! Message-oriented duplex channel abstraction.
//!
//! The engine consumes framed UTF-8 text over any transport that can
//! deliver an event stream plus a sink. Close codes and reasons pass
//! through untouched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{Receiver, Sender, unbounded};

use super::error::ChannelError;

/// Terminal and non-terminal events from the transport.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One inbound text frame.
    Frame(String),
    /// Transient transport fault; the transport decides whether it is
    /// terminal (a terminal fault is followed by `Closed`).
    Error(ChannelError),
    /// The connection is gone. Always the last event.
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Outbound half of a channel.
pub trait ChannelSink: Send + Sync {
    /// Hand a text frame to the transport. Non-blocking from the caller's
    /// point of view; backpressure is the transport's concern.
    fn send(&self, text: &str) -> Result<(), ChannelError>;

    /// Initiate graceful closure. Idempotent; the event stream eventually
    /// emits `Closed`.
    fn close(&self, code: Option<u16>, reason: Option<&str>);
}

/// What a session driver owns: the inbound event stream and the sink.
pub struct ChannelHandle {
    pub events: Receiver<ChannelEvent>,
    pub sink: Arc<dyn ChannelSink>,
}

struct MemorySink {
    peer_events: Sender<ChannelEvent>,
    local_events: Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl ChannelSink for MemorySink {
    fn send(&self, text: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.peer_events
            .send(ChannelEvent::Frame(text.to_string()))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for side in [&self.peer_events, &self.local_events] {
            let _ = side.send(ChannelEvent::Closed {
                code,
                reason: reason.map(str::to_string),
            });
        }
    }
}

/// Two connected in-memory channels, for driving sessions without sockets.
/// Closing either side delivers `Closed` to both.
pub fn memory_pair() -> (ChannelHandle, ChannelHandle) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    let a = ChannelHandle {
        events: a_rx,
        sink: Arc::new(MemorySink {
            peer_events: b_tx.clone(),
            local_events: a_tx.clone(),
            closed: Arc::clone(&closed),
        }),
    };
    let b = ChannelHandle {
        events: b_rx,
        sink: Arc::new(MemorySink {
            peer_events: a_tx,
            local_events: b_tx,
            closed,
        }),
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_the_pair() {
        let (a, b) = memory_pair();
        a.sink.send("hello").unwrap();
        match b.events.recv().unwrap() {
            ChannelEvent::Frame(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn close_reaches_both_sides_once() {
        let (a, b) = memory_pair();
        a.sink.close(Some(1000), Some("done"));
        a.sink.close(Some(1000), Some("again"));
        for side in [&a, &b] {
            match side.events.recv().unwrap() {
                ChannelEvent::Closed { code, reason } => {
                    assert_eq!(code, Some(1000));
                    assert_eq!(reason.as_deref(), Some("done"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(a.sink.send("late").is_err());
    }
}
