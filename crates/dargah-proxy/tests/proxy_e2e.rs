//! End-to-end pipeline tests against a scripted backend.
//!
//! The fake backend speaks just enough of the v3 protocol: it answers
//! startup with AuthenticationOk + ReadyForQuery, liveness probes with a
//! single byte, and regular traffic with canned completions, while
//! reporting everything it saw over a channel.

use dargah_common::{Config, Role};
use dargah_proxy::auth;
use dargah_proxy::pg_wire::codec::read_frame;
use dargah_proxy::server::Proxy;
use dargah_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SECRET: &str = "e2e-secret";
const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
enum BackendEvent {
    Startup(Vec<(String, String)>),
    Query(String),
    Parse(String),
    Execute,
}

struct FakeBackend {
    addr: String,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    accept_task: JoinHandle<()>,
}

async fn spawn_fake_backend() -> FakeBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, events) = mpsc::unbounded_channel();
    let accept_task = tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(backend_conn(sock, tx.clone()));
        }
    });
    FakeBackend {
        addr,
        events,
        accept_task,
    }
}

fn cstr(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

fn parse_startup_params(body: &[u8]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut offset = 0;
    while offset < body.len() && body[offset] != 0 {
        let key = cstr(&body[offset..]);
        offset += key.len() + 1;
        let value = cstr(&body[offset..]);
        offset += value.len() + 1;
        params.push((key, value));
    }
    params
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut frame = vec![b'C'];
    frame.extend_from_slice(&((4 + tag.len() + 1) as u32).to_be_bytes());
    frame.extend_from_slice(tag.as_bytes());
    frame.push(0);
    frame
}

const READY: [u8; 6] = [b'Z', 0, 0, 0, 5, b'I'];

async fn backend_conn(mut sock: TcpStream, tx: mpsc::UnboundedSender<BackendEvent>) {
    loop {
        let mut first = [0u8; 1];
        if sock.read_exact(&mut first).await.is_err() {
            return;
        }

        if first[0] == 0 {
            // high byte of a startup length: no type byte means startup family
            let mut rest = [0u8; 3];
            if sock.read_exact(&mut rest).await.is_err() {
                return;
            }
            let len = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]) as usize;
            let mut body = vec![0u8; len - 4];
            if sock.read_exact(&mut body).await.is_err() {
                return;
            }
            let _ = tx.send(BackendEvent::Startup(parse_startup_params(&body[4..])));
            let _ = sock.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await;
            let _ = sock.write_all(&READY).await;
            continue;
        }

        let mut len_buf = [0u8; 4];
        if sock.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len.saturating_sub(4)];
        if sock.read_exact(&mut payload).await.is_err() {
            return;
        }

        match first[0] {
            b'Q' => {
                let sql = cstr(&payload);
                let probe = sql.starts_with("SELECT 1");
                let _ = tx.send(BackendEvent::Query(sql));
                if probe {
                    // a one-byte answer is consumed whole by the probe read
                    let _ = sock.write_all(b"N").await;
                } else {
                    let _ = sock.write_all(&command_complete("SELECT 1")).await;
                    let _ = sock.write_all(&READY).await;
                }
            }
            b'P' => {
                let statement = cstr(&payload);
                let sql = cstr(&payload[statement.len() + 1..]);
                let _ = tx.send(BackendEvent::Parse(sql));
                let _ = sock.write_all(&[b'1', 0, 0, 0, 4]).await;
            }
            b'B' => {
                let _ = sock.write_all(&[b'2', 0, 0, 0, 4]).await;
            }
            b'E' => {
                let _ = tx.send(BackendEvent::Execute);
                let _ = sock.write_all(&command_complete("INSERT 0 1")).await;
            }
            b'S' => {
                let _ = sock.write_all(&READY).await;
            }
            b'X' => return,
            _ => {}
        }
    }
}

struct Harness {
    proxy: Arc<Proxy>,
    addr: String,
    store: Store,
    backend: FakeBackend,
}

async fn start_proxy(role: Role, mutate: impl FnOnce(&mut Config)) -> Harness {
    let backend = spawn_fake_backend().await;

    let db_path = std::env::temp_dir().join(format!("dargah-e2e-{}.db", uuid::Uuid::new_v4()));
    let db_url = format!("sqlite:{}", db_path.display());

    let mut config = Config::for_tests(vec![backend.addr.clone()], SECRET, &db_url);
    mutate(&mut config);

    let store = Store::connect(&db_url).await.unwrap();
    store.migrate().await.unwrap();
    store.users().create("u1", "pw", role).await.unwrap();

    let proxy = Proxy::new(config, store.clone()).await.unwrap();
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let run_proxy = proxy.clone();
    tokio::spawn(async move {
        let _ = run_proxy.run(listener).await;
    });

    Harness {
        proxy,
        addr,
        store,
        backend,
    }
}

fn startup_bytes(params: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = vec![0, 0, 0, 0];
    buf.extend_from_slice(&196608u32.to_be_bytes());
    for (key, value) in params {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    buf.push(0);
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

fn simple_query(sql: &str) -> Vec<u8> {
    let mut frame = vec![b'Q'];
    frame.extend_from_slice(&((4 + sql.len() + 1) as u32).to_be_bytes());
    frame.extend_from_slice(sql.as_bytes());
    frame.push(0);
    frame
}

async fn next_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    tokio::time::timeout(Duration::from_secs(5), read_frame(stream, MAX_FRAME))
        .await
        .expect("timed out waiting for frame")
        .expect("frame read failed")
}

async fn wait_for_startup_event(backend: &mut FakeBackend) -> Vec<(String, String)> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match backend.events.recv().await {
                Some(BackendEvent::Startup(params)) => return params,
                Some(_) => continue,
                None => panic!("backend events channel closed"),
            }
        }
    })
    .await
    .expect("no startup reached the backend")
}

async fn handshake(harness: &Harness, role: Role) -> TcpStream {
    let token = auth::issue("u1", role, SECRET, 1).unwrap();
    let mut client = TcpStream::connect(&harness.addr).await.unwrap();
    client
        .write_all(&startup_bytes(&[
            ("user", "u1"),
            ("database", "db"),
            ("token", &token),
        ]))
        .await
        .unwrap();

    let (tag, _) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'R', "expected AuthenticationOk");
    let (tag, _) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'Z', "expected ReadyForQuery");
    client
}

async fn wait_for_request_rows(store: &Store) -> Vec<dargah_store::Request> {
    for _ in 0..100 {
        let page = store.requests().list(1, 10).await.unwrap();
        if !page.result.is_empty() {
            return page.result;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no request rows were audited");
}

#[tokio::test]
async fn happy_read_path() {
    let mut harness = start_proxy(Role::ReadWrite, |_| {}).await;
    let mut client = handshake(&harness, Role::ReadWrite).await;

    // the backend saw the rewritten startup: same params, no token
    let params = wait_for_startup_event(&mut harness.backend).await;
    assert!(params.iter().any(|(k, v)| k == "user" && v == "u1"));
    assert!(params.iter().any(|(k, v)| k == "database" && v == "db"));
    assert!(!params.iter().any(|(k, _)| k == "token"));

    client.write_all(&simple_query("SELECT now()")).await.unwrap();
    let (tag, payload) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'C');
    assert!(payload.starts_with(b"SELECT 1"));
    let (tag, _) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'Z');

    drop(client);

    let requests = wait_for_request_rows(&harness.store).await;
    assert_eq!(requests.len(), 1);
    let sqls = harness
        .store
        .sqls()
        .list_by_request(&requests[0].id)
        .await
        .unwrap();
    assert_eq!(sqls.len(), 1);
    assert_eq!(sqls[0].sql, "SELECT now()");
    assert!(sqls[0].is_read);
    assert!(sqls[0].completed_at.unwrap() >= sqls[0].created_at);

    harness.proxy.shutdown().await;
    harness.backend.accept_task.abort();
}

#[tokio::test]
async fn rbac_denies_writes_for_read_only() {
    let mut harness = start_proxy(Role::ReadOnly, |_| {}).await;
    let mut client = handshake(&harness, Role::ReadOnly).await;
    wait_for_startup_event(&mut harness.backend).await;

    client
        .write_all(&simple_query("DELETE FROM t"))
        .await
        .unwrap();

    let (tag, payload) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&payload);
    assert!(text.contains("42501"), "expected insufficient_privilege");
    let (tag, _) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'Z', "session continues after a denial");

    // session still usable for reads
    client.write_all(&simple_query("SELECT 2+2")).await.unwrap();
    let (tag, _) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'C');
    let (tag, _) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'Z');

    drop(client);

    // the denied statement never reached the backend
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = harness.backend.events.try_recv() {
        if let BackendEvent::Query(sql) = event {
            assert!(!sql.contains("DELETE"), "denied write was forwarded: {sql}");
        }
    }

    // but it was audited, classified as a write
    let requests = wait_for_request_rows(&harness.store).await;
    let sqls = harness
        .store
        .sqls()
        .list_by_request(&requests[0].id)
        .await
        .unwrap();
    assert_eq!(sqls.len(), 2);
    assert!(sqls.iter().any(|s| s.sql == "DELETE FROM t" && !s.is_read));

    harness.proxy.shutdown().await;
    harness.backend.accept_task.abort();
}

#[tokio::test]
async fn missing_token_is_rejected_before_routing() {
    let mut harness = start_proxy(Role::ReadWrite, |_| {}).await;

    let mut client = TcpStream::connect(&harness.addr).await.unwrap();
    client
        .write_all(&startup_bytes(&[("user", "u1"), ("database", "db")]))
        .await
        .unwrap();

    let (tag, payload) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&payload).contains("28000"));

    // the proxy closes the socket
    let eof = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut client, MAX_FRAME))
        .await
        .unwrap()
        .unwrap();
    assert!(eof.is_none());

    // nothing reached any backend and no pool acquisition happened
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = harness.backend.events.try_recv() {
        assert!(
            !matches!(event, BackendEvent::Startup(_)),
            "startup must not be forwarded without a token"
        );
    }

    harness.proxy.shutdown().await;
    harness.backend.accept_task.abort();
}

#[tokio::test]
async fn extended_protocol_materializes_bind_parameters() {
    let mut harness = start_proxy(Role::ReadWrite, |_| {}).await;
    let mut client = handshake(&harness, Role::ReadWrite).await;
    wait_for_startup_event(&mut harness.backend).await;

    // Parse "" "INSERT INTO t VALUES ($1,$2)"
    let mut parse_payload = Vec::new();
    parse_payload.push(0); // unnamed statement
    parse_payload.extend_from_slice(b"INSERT INTO t VALUES ($1,$2)\0");
    parse_payload.extend_from_slice(&0i16.to_be_bytes());
    let mut parse = vec![b'P'];
    parse.extend_from_slice(&((4 + parse_payload.len()) as u32).to_be_bytes());
    parse.extend_from_slice(&parse_payload);
    client.write_all(&parse).await.unwrap();

    // Bind "" "" with params ["alice", NULL], all text
    let mut bind_payload = Vec::new();
    bind_payload.push(0); // portal
    bind_payload.push(0); // statement
    bind_payload.extend_from_slice(&0i16.to_be_bytes()); // no format codes
    bind_payload.extend_from_slice(&2i16.to_be_bytes());
    bind_payload.extend_from_slice(&5i32.to_be_bytes());
    bind_payload.extend_from_slice(b"alice");
    bind_payload.extend_from_slice(&(-1i32).to_be_bytes());
    bind_payload.extend_from_slice(&0i16.to_be_bytes()); // no result formats
    let mut bind = vec![b'B'];
    bind.extend_from_slice(&((4 + bind_payload.len()) as u32).to_be_bytes());
    bind.extend_from_slice(&bind_payload);
    client.write_all(&bind).await.unwrap();

    // Execute unnamed portal, then Sync
    client.write_all(&[b'E', 0, 0, 0, 9, 0, 0, 0, 0, 0]).await.unwrap();
    client.write_all(&[b'S', 0, 0, 0, 4]).await.unwrap();

    for expected in [b'1', b'2', b'C', b'Z'] {
        let (tag, _) = next_frame(&mut client).await.unwrap();
        assert_eq!(tag, expected);
    }

    drop(client);

    let requests = wait_for_request_rows(&harness.store).await;
    let sqls = harness
        .store
        .sqls()
        .list_by_request(&requests[0].id)
        .await
        .unwrap();
    assert_eq!(sqls.len(), 1);
    assert_eq!(sqls[0].sql, "INSERT INTO t VALUES ('alice',NULL)");
    assert!(!sqls[0].is_read);

    harness.proxy.shutdown().await;
    harness.backend.accept_task.abort();
}

#[tokio::test]
async fn upstream_failure_is_observed_and_recorded() {
    let harness = start_proxy(Role::ReadWrite, |config| {
        config.ping_interval = 1;
    })
    .await;

    let (healthy, unhealthy) = harness.proxy.membership();
    assert_eq!(healthy.len(), 1);
    assert!(unhealthy.is_empty());

    // stop the backend and wait for the monitor to notice
    harness.backend.accept_task.abort();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let (healthy, unhealthy) = harness.proxy.membership();
    assert!(healthy.is_empty());
    assert_eq!(unhealthy.len(), 1);

    let transitions = harness
        .store
        .health_checks()
        .transition_count(&harness.backend.addr)
        .await
        .unwrap();
    assert_eq!(transitions, 1);

    // a new client is refused with connection_failure
    let token = auth::issue("u1", Role::ReadWrite, SECRET, 1).unwrap();
    let mut client = TcpStream::connect(&harness.addr).await.unwrap();
    client
        .write_all(&startup_bytes(&[("user", "u1"), ("token", &token)]))
        .await
        .unwrap();
    let (tag, payload) = next_frame(&mut client).await.unwrap();
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&payload).contains("08006"));

    harness.proxy.shutdown().await;
}

#[tokio::test]
async fn pool_saturation_blocks_then_proceeds() {
    let mut harness = start_proxy(Role::ReadWrite, |config| {
        config.connection_pool_size = 1;
    })
    .await;

    let first = handshake(&harness, Role::ReadWrite).await;
    wait_for_startup_event(&mut harness.backend).await;

    // second client blocks in acquire while the only connection is held
    let token = auth::issue("u1", Role::ReadWrite, SECRET, 1).unwrap();
    let mut second = TcpStream::connect(&harness.addr).await.unwrap();
    second
        .write_all(&startup_bytes(&[("user", "u1"), ("token", &token)]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(first); // releases the pooled connection

    let (tag, _) = next_frame(&mut second).await.unwrap();
    assert_eq!(tag, b'R', "second client proceeds after release");

    harness.proxy.shutdown().await;
    harness.backend.accept_task.abort();
}

#[tokio::test]
async fn pool_saturation_times_out_with_cannot_connect() {
    let mut harness = start_proxy(Role::ReadWrite, |config| {
        config.connection_pool_size = 1;
        config.acquire_timeout_secs = 1;
    })
    .await;

    let _first = handshake(&harness, Role::ReadWrite).await;
    wait_for_startup_event(&mut harness.backend).await;

    let token = auth::issue("u1", Role::ReadWrite, SECRET, 1).unwrap();
    let mut second = TcpStream::connect(&harness.addr).await.unwrap();
    second
        .write_all(&startup_bytes(&[("user", "u1"), ("token", &token)]))
        .await
        .unwrap();

    let (tag, payload) = next_frame(&mut second).await.unwrap();
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&payload).contains("08001"));

    harness.proxy.shutdown().await;
    harness.backend.accept_task.abort();
}
