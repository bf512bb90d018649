use std::time::Duration;

use krypton_client::config::ClientConfig;
use krypton_client::events::ClientEvent;
use krypton_client::session::{Client, PushOutcome, CLIENT_VERSION};
use krypton_misc::api::entry::{ClipboardEntry, ContentType};
use krypton_misc::code::sha256;
use krypton_misc::time::now_millis;
use krypton_proto::conn::Connection;
use krypton_proto::packet::*;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn test_config(addr: &str) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.server = addr.to_string();
    cfg.device_id = String::from("test-device-id");
    cfg.device_name = String::from("TestDevice");
    cfg.heartbeat_secs = 1;
    cfg.max_reconnect_attempts = 5;
    cfg.reconnect_delay_ms = 50;
    cfg
}

async fn send_hello(conn: &Connection, version: &str) {
    conn.send(&Packet::ServerHello(ServerHello {
        server_version: version.to_string(),
        tls_available: false,
        tls_required: false,
    }))
    .await
    .unwrap();
}

/// Serves hello, connect and api-key auth, leaving the session in the
/// authenticated state.
async fn handshake(conn: &Connection, version: &str) {
    send_hello(conn, version).await;

    match conn.must_recv().await.unwrap() {
        Packet::Connect(connect) => {
            assert_eq!(connect.device_name, "TestDevice");
            assert_eq!(connect.client_version, CLIENT_VERSION);
        }
        other => panic!("expected connect, got {}", other.name()),
    }
    conn.send(&Packet::ConnectAck(ConnectAck {
        server_version: version.to_string(),
        requires_auth: true,
    }))
    .await
    .unwrap();

    match conn.must_recv().await.unwrap() {
        Packet::AuthApiKey(auth) => assert_eq!(auth.api_key, "test-key"),
        other => panic!("expected api key auth, got {}", other.name()),
    }
    conn.send(&Packet::AuthResponse(AuthResponse {
        success: true,
        message: String::new(),
        user_id: Some(String::from("user-1")),
        api_key: None,
        admin: false,
    }))
    .await
    .unwrap();
}

async fn wait_event<F>(events: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn broadcast_entry(content: &str) -> ClipboardEntry {
    ClipboardEntry {
        id: String::from("entry-remote"),
        user_id: String::from("user-1"),
        content_type: ContentType::Text,
        content: content.as_bytes().to_vec(),
        preview: content.to_string(),
        hash: sha256(content),
        source_device: Some(String::from("Other")),
        create_time: now_millis(),
        external_path: None,
    }
}

#[tokio::test]
async fn client_connect_auth_push() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        handshake(&conn, CLIENT_VERSION).await;

        match conn.must_recv().await.unwrap() {
            Packet::ClipboardPush(push) => {
                assert_eq!(push.entry.content, b"hello from client");
                assert_eq!(push.entry.source_device.as_deref(), Some("TestDevice"));
            }
            other => panic!("expected push, got {}", other.name()),
        }
        conn.send(&Packet::ClipboardPushAck(ClipboardPushAck {
            success: true,
            entry_id: Some(String::from("entry-1")),
            message: String::new(),
        }))
        .await
        .unwrap();
    });

    let (client, mut events) = Client::start(test_config(&addr));
    client.connect().await.unwrap();
    let response = client.authenticate_key("test-key").await.unwrap();
    assert!(response.success);

    wait_event(&mut events, |e| {
        matches!(e, ClientEvent::AuthResult { success: true, .. })
    })
    .await;

    let outcome = client
        .push(ContentType::Text, b"hello from client".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        PushOutcome::Acked {
            entry_id: String::from("entry-1")
        }
    );

    server.await.unwrap();
}

#[tokio::test]
async fn client_version_mismatch_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        send_hello(&conn, "9.9.9").await;
        match conn.must_recv().await.unwrap() {
            Packet::Connect(_) => {}
            other => panic!("expected connect, got {}", other.name()),
        }
        conn.send(&Packet::ConnectAck(ConnectAck {
            server_version: String::from("9.9.9"),
            requires_auth: true,
        }))
        .await
        .unwrap();
        // Hold the connection open until the client is done.
        let _ = conn.recv().await;
    });

    let (client, mut events) = Client::start(test_config(&addr));
    client.connect().await.unwrap();

    let event = wait_event(&mut events, |e| {
        matches!(e, ClientEvent::ServerVersionMismatch { .. })
    })
    .await;
    match event {
        ClientEvent::ServerVersionMismatch {
            server_version,
            client_version,
        } => {
            assert_eq!(server_version, "9.9.9");
            assert_eq!(client_version, CLIENT_VERSION);
        }
        _ => unreachable!(),
    }

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn client_echo_suppression() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        handshake(&conn, CLIENT_VERSION).await;

        conn.send(&Packet::ClipboardBroadcast(ClipboardBroadcast {
            entry: broadcast_entry("duplicated"),
            from_device: Some(String::from("Other")),
        }))
        .await
        .unwrap();

        // The first push to arrive must be the non-duplicate one.
        match conn.must_recv().await.unwrap() {
            Packet::ClipboardPush(push) => {
                assert_eq!(push.entry.content, b"fresh content");
            }
            other => panic!("expected push, got {}", other.name()),
        }
        conn.send(&Packet::ClipboardPushAck(ClipboardPushAck {
            success: true,
            entry_id: Some(String::from("entry-2")),
            message: String::new(),
        }))
        .await
        .unwrap();
    });

    let (client, mut events) = Client::start(test_config(&addr));
    client.connect().await.unwrap();
    client.authenticate_key("test-key").await.unwrap();

    let event = wait_event(&mut events, |e| {
        matches!(e, ClientEvent::ClipboardReceived(_))
    })
    .await;
    match event {
        ClientEvent::ClipboardReceived(entry) => assert_eq!(entry.content, b"duplicated"),
        _ => unreachable!(),
    }

    // Pushing back what was just received is refused locally.
    let outcome = client
        .push(ContentType::Text, b"duplicated".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::Suppressed);

    let outcome = client
        .push(ContentType::Text, b"fresh content".to_vec(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, PushOutcome::Acked { .. }));

    server.await.unwrap();
}

#[tokio::test]
async fn client_heartbeat_latency() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        handshake(&conn, CLIENT_VERSION).await;

        loop {
            match conn.recv().await {
                Ok(Some(Packet::Heartbeat)) => {
                    conn.send(&Packet::HeartbeatAck).await.unwrap();
                }
                Ok(Some(other)) => panic!("expected heartbeat, got {}", other.name()),
                _ => return,
            }
        }
    });

    let (client, mut events) = Client::start(test_config(&addr));
    client.connect().await.unwrap();
    client.authenticate_key("test-key").await.unwrap();

    wait_event(&mut events, |e| matches!(e, ClientEvent::HeartbeatLatency(_))).await;

    let stats = client.stats().await.unwrap();
    assert!(!stats.latency_window.is_empty());
    assert!(stats.latency_window.len() <= 5);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn client_offline_queue_flush() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // First connection dies right after auth; the listener stays bound so
    // the reconnect cycle's next attempt lands on the second accept.
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        handshake(&conn, CLIENT_VERSION).await;
        conn.close().await;

        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        handshake(&conn, CLIENT_VERSION).await;

        // Whether queued and flushed or sent live after the restore, the
        // pushes must arrive in submission order.
        for expect in ["one", "two"] {
            match conn.must_recv().await.unwrap() {
                Packet::ClipboardPush(push) => {
                    assert_eq!(push.entry.content, expect.as_bytes());
                }
                other => panic!("expected push, got {}", other.name()),
            }
            conn.send(&Packet::ClipboardPushAck(ClipboardPushAck {
                success: true,
                entry_id: Some(format!("entry-{expect}")),
                message: String::new(),
            }))
            .await
            .unwrap();
        }
    });

    let (client, mut events) = Client::start(test_config(&addr));
    client.connect().await.unwrap();
    client.authenticate_key("test-key").await.unwrap();

    let one = client
        .push(ContentType::Text, b"one".to_vec(), None)
        .await
        .unwrap();
    let two = client
        .push(ContentType::Text, b"two".to_vec(), None)
        .await
        .unwrap();
    assert!(matches!(one, PushOutcome::Queued | PushOutcome::Acked { .. }));
    assert!(matches!(two, PushOutcome::Queued | PushOutcome::Acked { .. }));

    wait_event(&mut events, |e| matches!(e, ClientEvent::ConnectionRestored)).await;
    server.await.unwrap();

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert!(stats.authenticated);
}

#[tokio::test]
async fn client_reconnect_exhausted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::new(socket);
        handshake(&conn, CLIENT_VERSION).await;
        conn.close().await;
        drop(listener);
    });

    let mut cfg = test_config(&addr);
    cfg.max_reconnect_attempts = 2;
    cfg.reconnect_delay_ms = 20;

    let (client, mut events) = Client::start(cfg);
    client.connect().await.unwrap();
    client.authenticate_key("test-key").await.unwrap();
    server.await.unwrap();

    // Nobody is listening anymore; the cycle runs out of attempts.
    wait_event(&mut events, |e| matches!(e, ClientEvent::ConnectionLost)).await;

    let stats = client.stats().await.unwrap();
    assert!(!stats.authenticated);
    assert!(stats.was_ever_connected);
}
