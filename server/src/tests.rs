use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use krypton_misc::api::entry::{ContentType, NewEntry};
use krypton_misc::code::sha256;
use krypton_proto::conn::Connection;
use krypton_proto::packet::*;
use krypton_proto::tls;
use tokio_util::sync::CancellationToken;

use crate::context::ServerContext;
use crate::recycle;
use crate::registry::Registry;
use crate::server::Server;

struct TestServer {
    addr: String,
    ctx: Arc<ServerContext>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start(ctx: Arc<ServerContext>) -> Self {
        let server = Server::new(ctx.clone()).unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let registry = server.registry();
        let shutdown = server.shutdown_token();
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
        Self {
            addr,
            ctx,
            registry,
            shutdown,
        }
    }

    async fn start_default() -> Self {
        Self::start(ServerContext::new_test()).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Dials the server and consumes the hello, which must arrive before the
/// client writes a single byte.
async fn dial(server: &TestServer) -> Connection {
    let conn = Connection::dial(&server.addr).await.unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ServerHello(hello) => {
            assert!(!hello.server_version.is_empty());
        }
        other => panic!("expected server hello, got {}", other.name()),
    }
    conn
}

async fn do_connect(conn: &Connection, device_name: &str) {
    conn.send(&Packet::Connect(Connect {
        client_version: String::from("1.0.0"),
        platform: String::from("Test"),
        device_id: format!("dev-{device_name}"),
        device_name: device_name.to_string(),
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ConnectAck(ack) => assert!(ack.requires_auth),
        other => panic!("expected connect ack, got {}", other.name()),
    }
}

async fn do_register(conn: &Connection, username: &str, password: &str) -> (String, String) {
    conn.send(&Packet::AuthRegister(AuthRegister {
        username: username.to_string(),
        password: password.to_string(),
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::AuthResponse(resp) => {
            assert!(resp.success, "register failed: {}", resp.message);
            (resp.user_id.unwrap(), resp.api_key.unwrap())
        }
        other => panic!("expected auth response, got {}", other.name()),
    }
}

async fn do_auth_key(conn: &Connection, api_key: &str) -> String {
    conn.send(&Packet::AuthApiKey(AuthApiKey {
        api_key: api_key.to_string(),
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::AuthResponse(resp) => {
            assert!(resp.success, "api key auth failed: {}", resp.message);
            resp.user_id.unwrap()
        }
        other => panic!("expected auth response, got {}", other.name()),
    }
}

async fn do_push(conn: &Connection, content: &str) -> String {
    conn.send(&Packet::ClipboardPush(ClipboardPush {
        entry: NewEntry {
            content_type: ContentType::Text,
            content: content.as_bytes().to_vec(),
            preview: None,
            source_device: None,
        },
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ClipboardPushAck(ack) => {
            assert!(ack.success, "push failed: {}", ack.message);
            ack.entry_id.unwrap()
        }
        other => panic!("expected push ack, got {}", other.name()),
    }
}

/// A heartbeat round proves no other packet is queued for this session.
async fn assert_idle(conn: &Connection) {
    conn.send(&Packet::Heartbeat).await.unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::HeartbeatAck => {}
        other => panic!("expected heartbeat ack, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_hello_and_connect() {
    let server = TestServer::start_default().await;

    let conn = Connection::dial(&server.addr).await.unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ServerHello(hello) => {
            assert!(!hello.tls_available);
            assert!(!hello.tls_required);
        }
        other => panic!("expected server hello, got {}", other.name()),
    }

    do_connect(&conn, "A").await;
    assert_idle(&conn).await;
}

#[tokio::test]
async fn test_auth_gate() {
    let server = TestServer::start_default().await;
    let conn = dial(&server).await;
    do_connect(&conn, "A").await;

    conn.send(&Packet::ClipboardPush(ClipboardPush {
        entry: NewEntry {
            content_type: ContentType::Text,
            content: b"sneaky".to_vec(),
            preview: None,
            source_device: None,
        },
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ErrorResponse(err) => {
            assert_eq!(err.code, CODE_AUTH_REQUIRED);
            assert!(err.message.contains("Authentication required"));
        }
        other => panic!("expected error response, got {}", other.name()),
    }

    // The session survives in the connected state and can still
    // authenticate.
    let (user_id, _) = do_register(&conn, "alice", "hunter22!").await;
    assert_idle(&conn).await;

    // Nothing was persisted by the gated push.
    let (_, total, _) = server.ctx.store.history(&user_id, 10, 0).unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_register_push_fanout() {
    let server = TestServer::start_default().await;

    let conn_a = dial(&server).await;
    do_connect(&conn_a, "A").await;
    let (user_id, api_key) = do_register(&conn_a, "alice", "hunter22!").await;

    let conn_b = dial(&server).await;
    do_connect(&conn_b, "B").await;
    let user_id_b = do_auth_key(&conn_b, &api_key).await;
    assert_eq!(user_id, user_id_b);

    let entry_id = do_push(&conn_a, "hello").await;

    // B receives the broadcast with the full content; A does not see its
    // own entry again.
    match conn_b.must_recv().await.unwrap() {
        Packet::ClipboardBroadcast(broadcast) => {
            assert_eq!(broadcast.entry.id, entry_id);
            assert_eq!(broadcast.entry.content, b"hello");
            assert_eq!(broadcast.entry.hash, sha256("hello"));
            assert_eq!(broadcast.from_device.as_deref(), Some("A"));
        }
        other => panic!("expected broadcast, got {}", other.name()),
    }
    assert_idle(&conn_a).await;

    // Pull from B sees the durable entry.
    conn_b
        .send(&Packet::ClipboardPull(ClipboardPull {
            limit: 10,
            offset: 0,
        }))
        .await
        .unwrap();
    match conn_b.must_recv().await.unwrap() {
        Packet::ClipboardHistory(history) => {
            assert_eq!(history.total_count, 1);
            assert!(!history.has_more);
            assert_eq!(history.entries.len(), 1);
            assert_eq!(history.entries[0].content, b"hello");
        }
        other => panic!("expected history, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_persist_before_ack() {
    let server = TestServer::start_default().await;
    let conn = dial(&server).await;
    do_connect(&conn, "A").await;
    do_register(&conn, "alice", "hunter22!").await;

    let entry_id = do_push(&conn, "durable").await;

    // The ack means the entry is already visible to a pull.
    conn.send(&Packet::ClipboardPull(ClipboardPull {
        limit: 10,
        offset: 0,
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ClipboardHistory(history) => {
            assert_eq!(history.total_count, 1);
            assert_eq!(history.entries[0].id, entry_id);
        }
        other => panic!("expected history, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_user_isolation() {
    let server = TestServer::start_default().await;

    let conn_a = dial(&server).await;
    do_connect(&conn_a, "A").await;
    do_register(&conn_a, "alice", "hunter22!").await;

    let conn_b = dial(&server).await;
    do_connect(&conn_b, "B").await;
    do_register(&conn_b, "bob", "password123").await;

    do_push(&conn_a, "alice secret").await;

    // No packet derived from alice's state reaches bob.
    assert_idle(&conn_b).await;
    conn_b
        .send(&Packet::ClipboardPull(ClipboardPull {
            limit: 10,
            offset: 0,
        }))
        .await
        .unwrap();
    match conn_b.must_recv().await.unwrap() {
        Packet::ClipboardHistory(history) => assert_eq!(history.total_count, 0),
        other => panic!("expected history, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_search_move_delete() {
    let server = TestServer::start_default().await;
    let conn = dial(&server).await;
    do_connect(&conn, "A").await;
    do_register(&conn, "alice", "hunter22!").await;

    let first = do_push(&conn, "Hello World").await;
    do_push(&conn, "unrelated").await;

    conn.send(&Packet::ClipboardSearch(ClipboardSearch {
        query: String::from("hello"),
        limit: 10,
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ClipboardSearchResult(result) => {
            assert_eq!(result.total_matches, 1);
            assert_eq!(result.entries[0].id, first);
        }
        other => panic!("expected search result, got {}", other.name()),
    }

    conn.send(&Packet::ClipboardMoveToTop(ClipboardMoveToTop {
        entry_id: first.clone(),
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ClipboardMoveToTopAck(ack) => assert!(ack.success),
        other => panic!("expected move ack, got {}", other.name()),
    }

    conn.send(&Packet::ClipboardDelete(ClipboardDelete {
        entry_id: String::from("not-an-entry"),
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ClipboardDeleteAck(ack) => {
            assert!(!ack.success);
            assert_eq!(ack.message, "Entry not found");
        }
        other => panic!("expected delete ack, got {}", other.name()),
    }

    conn.send(&Packet::ClipboardDelete(ClipboardDelete { entry_id: first }))
        .await
        .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ClipboardDeleteAck(ack) => assert!(ack.success),
        other => panic!("expected delete ack, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_out_of_order_closes_session() {
    let server = TestServer::start_default().await;
    let conn = dial(&server).await;
    do_connect(&conn, "A").await;

    // A second connect is out of order: one error response, then close.
    conn.send(&Packet::Connect(Connect {
        client_version: String::from("1.0.0"),
        platform: String::from("Test"),
        device_id: String::from("dev-dup"),
        device_name: String::from("dup"),
    }))
    .await
    .unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ErrorResponse(err) => assert_eq!(err.code, CODE_BAD_REQUEST),
        other => panic!("expected error response, got {}", other.name()),
    }
    let eof = tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_stale_session_eviction() {
    let server = TestServer::start_default().await;

    // A tight sweep stands in for the production 30s interval.
    tokio::spawn(recycle::start_stale_sweep(
        server.registry.clone(),
        200,
        Duration::from_millis(50),
        server.shutdown.clone(),
    ));

    let conn = dial(&server).await;
    do_connect(&conn, "A").await;
    assert_eq!(server.registry.len(), 1);

    // No heartbeats: the sweeper must evict the session and close the
    // stream well within two seconds.
    let eof = tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("session was not evicted")
        .unwrap();
    assert!(eof.is_none());

    // The registry forgets the session too.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.registry.len(), 0);
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive() {
    let server = TestServer::start_default().await;

    tokio::spawn(recycle::start_stale_sweep(
        server.registry.clone(),
        300,
        Duration::from_millis(50),
        server.shutdown.clone(),
    ));

    let conn = dial(&server).await;
    do_connect(&conn, "A").await;

    // Heartbeating faster than the timeout keeps the session registered.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_idle(&conn).await;
    }
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn test_tls_upgrade_session() {
    let certified = rcgen::generate_simple_self_signed(vec![String::from("localhost")]).unwrap();
    fs::create_dir_all("testdata").unwrap();
    let cert_path = PathBuf::from("testdata/session_tls_cert.pem");
    let key_path = PathBuf::from("testdata/session_tls_key.pem");
    fs::write(&cert_path, certified.cert.pem()).unwrap();
    fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let mut cfg = ServerContext::test_cfg();
    cfg.tls.enable = true;
    cfg.tls.cert_path = format!("{}", cert_path.display());
    cfg.tls.key_path = format!("{}", key_path.display());
    let ctx = ServerContext::new_test_cfg(cfg);
    let server = TestServer::start(ctx).await;

    let conn = Connection::dial(&server.addr).await.unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::ServerHello(hello) => {
            assert!(hello.tls_available);
            assert!(!hello.tls_required);
        }
        other => panic!("expected server hello, got {}", other.name()),
    }

    conn.send(&Packet::StartTls).await.unwrap();
    match conn.must_recv().await.unwrap() {
        Packet::StartTlsAck(ack) => assert!(ack.success, "{}", ack.message),
        other => panic!("expected starttls ack, got {}", other.name()),
    }
    // Development-style client: trust disabled by explicit opt-in.
    let connector = tls::build_connector(None, true).unwrap();
    conn.upgrade_client(&connector, tls::server_name("localhost").unwrap())
        .await
        .unwrap();
    assert!(conn.is_tls());

    // Back in the greeted state over TLS: connect, auth and push all flow
    // on the upgraded stream.
    do_connect(&conn, "A").await;
    let (user_id, _) = do_register(&conn, "alice", "hunter22!").await;
    do_push(&conn, "over tls").await;

    let (entries, total, _) = server.ctx.store.history(&user_id, 10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(entries[0].content, b"over tls");
}

#[tokio::test]
async fn test_tls_required_rejects_plaintext_connect() {
    let mut cfg = ServerContext::test_cfg();
    cfg.tls.required = true;
    let ctx = ServerContext::new_test_cfg(cfg);
    let server = TestServer::start(ctx).await;

    let conn = dial(&server).await;
    conn.send(&Packet::Connect(Connect {
        client_version: String::from("1.0.0"),
        platform: String::from("Test"),
        device_id: String::from("dev-plain"),
        device_name: String::from("plain"),
    }))
    .await
    .unwrap();

    match conn.must_recv().await.unwrap() {
        Packet::ErrorResponse(err) => assert!(err.message.contains("TLS")),
        other => panic!("expected error response, got {}", other.name()),
    }
    let eof = tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_max_connections() {
    let mut cfg = ServerContext::test_cfg();
    cfg.max_connections = 1;
    let ctx = ServerContext::new_test_cfg(cfg);
    let server = TestServer::start(ctx).await;

    let first = dial(&server).await;
    do_connect(&first, "A").await;

    // The second accept is closed immediately with no hello.
    let second = Connection::dial(&server.addr).await.unwrap();
    let eof = tokio::time::timeout(Duration::from_secs(2), second.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(eof.is_none());

    // The first session is unaffected.
    assert_idle(&first).await;
}
