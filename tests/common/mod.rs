//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use tidemark::{MemoryStore, NodeId};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn node(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

pub fn store(s: &str) -> MemoryStore {
    MemoryStore::new(node(s))
}

/// Poll until `cond` holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub const SYNC_WAIT: Duration = Duration::from_secs(5);
