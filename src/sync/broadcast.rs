//! Change-stream fan-out.
//!
//! Each session holds its own independent subscription; there is no shared
//! buffer. The store publishes under its own lock and returns immediately;
//! sessions drain their channels on their own threads.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::core::TableChange;

#[derive(Clone, Default)]
pub struct ChangeBroadcaster {
    subscribers: Arc<Mutex<Vec<Sender<TableChange>>>>,
}

impl ChangeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .expect("broadcaster lock poisoned")
            .push(tx);
        ChangeSubscription { receiver: rx }
    }

    /// Deliver to every live subscriber; dropped subscriptions are pruned.
    pub fn publish(&self, change: TableChange) {
        self.subscribers
            .lock()
            .expect("broadcaster lock poisoned")
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("broadcaster lock poisoned")
            .len()
    }
}

/// One session's view of the change stream. Dropping it detaches from the
/// broadcaster on the next publish.
pub struct ChangeSubscription {
    receiver: Receiver<TableChange>,
}

impl ChangeSubscription {
    pub fn receiver(&self) -> &Receiver<TableChange> {
        &self.receiver
    }

    pub fn into_receiver(self) -> Receiver<TableChange> {
        self.receiver
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::core::{Hlc, NodeId};

    fn change(ms: u64) -> TableChange {
        TableChange {
            hlc: Hlc::new(ms, 0, NodeId::new("n").unwrap()),
            tables: BTreeSet::from(["t".to_string()]),
        }
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let broadcaster = ChangeBroadcaster::new();
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        broadcaster.publish(change(1));
        assert_eq!(a.receiver().try_recv().unwrap(), change(1));
        assert_eq!(b.receiver().try_recv().unwrap(), change(1));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let broadcaster = ChangeBroadcaster::new();
        let a = broadcaster.subscribe();
        drop(broadcaster.subscribe());
        broadcaster.publish(change(1));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(a.receiver().try_recv().is_ok());
    }
}
