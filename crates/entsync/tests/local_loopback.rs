// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-level integration: local listener, accept, payload fidelity,
//! handle invalidation.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use entsync::{ConnectionManager, ConnectionState, LocalServer, NetworkError};

fn socket_path(name: &str) -> PathBuf {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    std::mem::forget(dir);
    path
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[allow(dead_code)] // keeps managers alive for the test's duration
struct Loopback {
    server_mgr: ConnectionManager,
    client_mgr: ConnectionManager,
    server: LocalServer,
    client: entsync::ConnectionHandle,
    accepted: entsync::ConnectionHandle,
}

fn connect_pair(name: &str) -> Loopback {
    let server_mgr = ConnectionManager::new(8);
    let client_mgr = ConnectionManager::new(8);
    let path = socket_path(name);

    let server = LocalServer::new(&server_mgr, &path);
    server.listen().expect("listen");

    let client = client_mgr.open_local(&path).expect("open");
    client.connect().expect("connect");

    let accepted = server.accept();
    assert!(accepted.valid(), "accept returned invalid handle");
    assert!(
        wait_until(
            || client.is_connected() && accepted.is_connected(),
            Duration::from_secs(2)
        ),
        "establishment timed out"
    );

    Loopback {
        server_mgr,
        client_mgr,
        server,
        client,
        accepted,
    }
}

#[test]
fn test_bidirectional_payload_fidelity() {
    let pair = connect_pair("fidelity.sock");

    let at_server: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let at_client: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&at_server);
        pair.accepted
            .set_message_callback(Arc::new(move |data: &[u8]| sink.lock().push(data.to_vec())))
            .unwrap();
        let sink = Arc::clone(&at_client);
        pair.client
            .set_message_callback(Arc::new(move |data: &[u8]| sink.lock().push(data.to_vec())))
            .unwrap();
    }

    // Payload boundaries survive in both directions, in order.
    for i in 0..20u32 {
        pair.client.send(format!("c->s {}", i).as_bytes()).unwrap();
        pair.accepted.send(format!("s->c {}", i).as_bytes()).unwrap();
    }
    assert!(wait_until(
        || at_server.lock().len() == 20 && at_client.lock().len() == 20,
        Duration::from_secs(2)
    ));
    for (i, payload) in at_server.lock().iter().enumerate() {
        assert_eq!(payload, format!("c->s {}", i).as_bytes());
    }
    for (i, payload) in at_client.lock().iter().enumerate() {
        assert_eq!(payload, format!("s->c {}", i).as_bytes());
    }

    let stats = pair.client.stats();
    assert_eq!(stats.messages_sent, 20);
    assert_eq!(stats.messages_received, 20);
    assert!(stats.connect_time_ms > 0);

    pair.server.close().unwrap();
}

#[test]
fn test_close_invalidates_all_copies() {
    let pair = connect_pair("invalidate.sock");

    let copy = pair.client.clone();
    assert!(copy.valid());
    pair.client.close().unwrap();
    assert!(!pair.client.valid());
    assert!(!copy.valid());
    assert!(matches!(
        copy.send(b"stale"),
        Err(NetworkError::InvalidParameter(_))
    ));
    assert_eq!(pair.client_mgr.active_count(), 0);

    // The server side notices the peer going away.
    assert!(wait_until(
        || pair.accepted.state() == ConnectionState::Disconnected,
        Duration::from_secs(2)
    ));
    pair.server.close().unwrap();
}

#[test]
fn test_slot_reuse_changes_generation() {
    let pair = connect_pair("reuse.sock");
    let old = pair.client.clone();
    pair.client.close().unwrap();

    // The freed slot is reusable; the old handle stays dead.
    let fresh = pair.client_mgr.open_local(socket_path("other.sock")).unwrap();
    assert!(fresh.valid());
    assert!(!old.valid());
    assert_ne!(fresh, old);

    pair.server.close().unwrap();
}

#[test]
fn test_disconnect_keeps_slot() {
    let pair = connect_pair("disconnect.sock");

    pair.client.disconnect().unwrap();
    // Disconnect does not free the slot; the handle stays valid.
    assert!(pair.client.valid());
    assert_eq!(pair.client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        pair.client.send(b"down"),
        Err(NetworkError::ConnectionClosed(_))
    ));
    assert_eq!(pair.client_mgr.active_count(), 1);

    pair.client.close().unwrap();
    assert!(!pair.client.valid());
    pair.server.close().unwrap();
}

#[test]
fn test_multiple_clients_accepted() {
    let server_mgr = ConnectionManager::new(8);
    let client_mgr = ConnectionManager::new(8);
    let path = socket_path("many.sock");
    let server = LocalServer::new(&server_mgr, &path);
    server.listen().unwrap();

    let mut clients = Vec::new();
    let mut accepted = Vec::new();
    for _ in 0..3 {
        let client = client_mgr.open_local(&path).unwrap();
        client.connect().unwrap();
        let conn = server.accept();
        assert!(conn.valid());
        accepted.push(conn);
        clients.push(client);
    }
    assert_eq!(server_mgr.active_count(), 3);
    assert_eq!(client_mgr.active_count(), 3);

    // Handles are distinct identities.
    let unique: std::collections::HashSet<_> = accepted.iter().cloned().collect();
    assert_eq!(unique.len(), 3);

    server.close().unwrap();
}
