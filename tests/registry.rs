//! Server registry behavior: counting, targeted disconnects, stale-peer
//! eviction.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{SYNC_WAIT, init_tracing, node, store, wait_until};
use tidemark::sync::tcp::{FRAME_TEXT, FrameWriter};
use tidemark::{SessionHooks, SyncClient, SyncConfig, SyncServer};

#[test]
fn registry_tracks_connected_nodes() {
    init_tracing();
    let server_store = Arc::new(store("srv"));
    let server = SyncServer::new(
        "127.0.0.1:0",
        Arc::clone(&server_store),
        SyncConfig::default(),
        SessionHooks::default(),
    )
    .start()
    .expect("server start");
    assert_eq!(server.client_count(), 0);

    let c1_store = Arc::new(store("c1"));
    let c1 = SyncClient::new(
        server.local_addr().to_string(),
        Arc::clone(&c1_store),
        SyncConfig::default(),
        SessionHooks::default(),
    );
    c1.connect();
    assert!(wait_until(SYNC_WAIT, || server.client_count() == 1));
    assert_eq!(server.connected_nodes(), vec![node("c1")]);

    c1.disconnect(None, None);
    assert!(wait_until(SYNC_WAIT, || server.client_count() == 0));
    server.shutdown();
}

#[test]
fn targeted_disconnect_removes_only_that_node() {
    init_tracing();
    let server_store = Arc::new(store("srv"));
    let server = SyncServer::new(
        "127.0.0.1:0",
        Arc::clone(&server_store),
        SyncConfig::default(),
        SessionHooks::default(),
    )
    .start()
    .expect("server start");

    let c1_store = Arc::new(store("c1"));
    let c2_store = Arc::new(store("c2"));
    let c1 = SyncClient::new(
        server.local_addr().to_string(),
        Arc::clone(&c1_store),
        SyncConfig::default(),
        SessionHooks::default(),
    );
    let c2 = SyncClient::new(
        server.local_addr().to_string(),
        Arc::clone(&c2_store),
        SyncConfig::default(),
        SessionHooks::default(),
    );
    c1.connect();
    c2.connect();
    assert!(wait_until(SYNC_WAIT, || server.client_count() == 2));

    // Returns only after the session has fully terminated.
    server.disconnect(&node("c1"), Some(1000), Some("kicked"));
    assert_eq!(server.connected_nodes(), vec![node("c2")]);

    // The kicked client is still in online mode and eventually comes back.
    assert!(wait_until(Duration::from_secs(10), || {
        server.connected_nodes().contains(&node("c1"))
    }));

    c1.disconnect(None, None);
    c2.disconnect(None, None);
    server.shutdown();
}

#[test]
fn disconnect_all_empties_the_registry() {
    init_tracing();
    let server_store = Arc::new(store("srv"));
    let server = SyncServer::new(
        "127.0.0.1:0",
        Arc::clone(&server_store),
        SyncConfig::default(),
        SessionHooks::default(),
    )
    .start()
    .expect("server start");

    let clients: Vec<_> = ["c1", "c2", "c3"]
        .iter()
        .map(|name| {
            let client = SyncClient::new(
                server.local_addr().to_string(),
                Arc::new(store(name)),
                SyncConfig::default(),
                SessionHooks::default(),
            );
            client.connect();
            client
        })
        .collect();
    assert!(wait_until(SYNC_WAIT, || server.client_count() == 3));

    server.disconnect_all(Some(1000), Some("maintenance"));
    assert_eq!(server.client_count(), 0);

    for client in &clients {
        client.disconnect(None, None);
    }
    server.shutdown();
}

#[test]
fn silent_peer_is_evicted_by_keepalive() {
    init_tracing();
    let server_store = Arc::new(store("srv"));
    server_store.insert("todos", "r", json!({}));
    let config = SyncConfig {
        ping_interval_ms: Some(100),
        dead_ms: 400,
        ..SyncConfig::default()
    };
    let server = SyncServer::new(
        "127.0.0.1:0",
        Arc::clone(&server_store),
        config.clone(),
        SessionHooks::default(),
    )
    .start()
    .expect("server start");

    // A raw peer that completes the handshake and then never answers pings.
    let stream = TcpStream::connect(server.local_addr()).expect("raw connect");
    let mut writer = FrameWriter::new(stream.try_clone().expect("clone"), config.max_frame_bytes);
    let handshake =
        r#"{"node_id":"raw","last_modified":"1970-01-01T00:00:00.000Z-0000-raw","data":null}"#;
    writer
        .write_frame(FRAME_TEXT, handshake.as_bytes())
        .expect("handshake write");

    assert!(wait_until(SYNC_WAIT, || server.client_count() == 1));
    // Dead interval (400 ms) with no pongs: the transport closes the
    // channel and the registry drops the session.
    assert!(wait_until(Duration::from_secs(3), || server.client_count() == 0));

    drop(writer);
    let _ = stream.shutdown(std::net::Shutdown::Both);
    server.shutdown();
}

#[test]
fn upgrade_hooks_observe_inbound_connections() {
    init_tracing();
    let server_store = Arc::new(store("srv"));
    let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let server = {
        let seen = Arc::clone(&seen);
        SyncServer::new(
            "127.0.0.1:0",
            Arc::clone(&server_store),
            SyncConfig::default(),
            SessionHooks::default(),
        )
        .on_connecting(move |_addr| {
            seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        })
        .start()
        .expect("server start")
    };

    let stream = TcpStream::connect(server.local_addr()).expect("connect");
    assert!(wait_until(SYNC_WAIT, || {
        seen.load(std::sync::atomic::Ordering::Relaxed) == 1
    }));
    let mut raw = stream;
    let _ = raw.write_all(b"\x00");
    let _ = raw.shutdown(std::net::Shutdown::Both);
    server.shutdown();
}
