//! End-to-end scenarios over real loopback TCP sockets.
//!
//! Mirrors spec.md §8's S1-S6 concrete scenarios. Follows the corpus's
//! convention of driving network services against real sockets rather than
//! a mocked transport (the teacher's `xtransport` only mocks at the
//! byte-buffer level for its own unit tests, never for a full server).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkframe::{Frame, Line};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use linkhub_server::app::{AppFactory, AppInstance};
use linkhub_server::client::ClientObject;
use linkhub_server::config::NetworkConfig;
use linkhub_server::connection::{ConnectionServer, HeaderAckIdExtractor};
use linkhub_server::error::Error;
use linkhub_server::registry::Registry;

/// Bounces whatever it's handed straight back out under the same app
/// header. Used for S1.
struct EchoApp {
    client: Arc<ClientObject>,
    app_ident: u8,
    app_id: u8,
}

#[async_trait]
impl AppInstance for EchoApp {
    async fn start(&self) {}
    async fn pause(&self) {}
    async fn stop(&self) {}
    async fn handle(&self, app_header_byte: u8, payload: &[u8]) {
        let value: serde_json::Value = serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null);
        let _ = self
            .client
            .write_app(self.app_ident, self.app_id, app_header_byte, &value, None, false, false)
            .await;
    }
}

struct EchoFactory;

#[async_trait]
impl AppFactory for EchoFactory {
    async fn create(&self, client: Arc<ClientObject>, app_id: u8) -> linkhub_server::error::Result<Arc<dyn AppInstance>> {
        Ok(Arc::new(EchoApp { client, app_ident: 0, app_id }))
    }
}

/// Counts `handle` and `start` calls so tests can observe delivery/lifecycle
/// behavior without a real application protocol.
struct CountingApp {
    handled: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl AppInstance for CountingApp {
    async fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    async fn pause(&self) {}
    async fn stop(&self) {}
    async fn handle(&self, _app_header_byte: u8, _payload: &[u8]) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingFactory {
    handled: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl AppFactory for CountingFactory {
    async fn create(&self, _client: Arc<ClientObject>, _app_id: u8) -> linkhub_server::error::Result<Arc<dyn AppInstance>> {
        Ok(Arc::new(CountingApp {
            handled: self.handled.clone(),
            started: self.started.clone(),
        }))
    }
}

async fn start_server(cfg: NetworkConfig) -> (Arc<Registry>, std::net::SocketAddr) {
    let registry = Registry::new(cfg.with_hostname("127.0.0.1").with_port(0));
    let server = ConnectionServer::new(registry.clone(), Arc::new(HeaderAckIdExtractor));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (registry, addr)
}

async fn login(stream: &mut TcpStream, client_id: &str) {
    let line = format!("2c0000002c{client_id}\n");
    stream.write_all(line.as_bytes()).await.unwrap();
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    let decoded = Frame::decode(&buf[..n - 1]).unwrap();
    match decoded {
        Line::Frame(f) => {
            assert!(f.is_ack(), "expected an immediate login ack");
            assert_eq!(f.seq, 0x2c);
        }
        Line::Keepalive => panic!("expected login ack, got keepalive"),
    }
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            return buf;
        }
        buf.push(byte[0]);
    }
}

#[tokio::test]
async fn s1_login_and_echo() {
    let mut cfg = NetworkConfig::default();
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;
    registry.factories.register(0, Arc::new(EchoFactory));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    login(&mut stream, "device-a").await;

    let frame = Frame::new_data(1, false, &[0, 0, 1], b"\"hi\"").unwrap();
    let mut buf = vec![0u8; frame.wire_len()];
    frame.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();

    let line = read_frame(&mut stream).await;
    let decoded = match Frame::decode(&line).unwrap() {
        Line::Frame(f) => f,
        Line::Keepalive => panic!("expected echoed frame"),
    };
    assert_eq!(decoded.app_header(), &[0, 0, 1]);
    assert_eq!(decoded.payload, b"\"hi\"");
    assert!(!decoded.is_ack());
}

#[tokio::test]
async fn s2_qos_duplicate_gets_one_delivery_two_acks() {
    let mut cfg = NetworkConfig::default();
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    registry.factories.register(
        0,
        Arc::new(CountingFactory { handled: handled.clone(), started: started.clone() }),
    );

    let mut stream = TcpStream::connect(addr).await.unwrap();
    login(&mut stream, "device-b").await;

    let frame = Frame::new_data(7, true, &[0, 0, 1], b"1").unwrap();
    let mut buf = vec![0u8; frame.wire_len()];
    frame.encode(&mut buf).unwrap();

    for _ in 0..2 {
        stream.write_all(&buf).await.unwrap();
        let line = read_frame(&mut stream).await;
        let ack = match Frame::decode(&line).unwrap() {
            Line::Frame(f) => f,
            Line::Keepalive => panic!("expected ack"),
        };
        assert!(ack.is_ack());
        assert_eq!(ack.seq, 7);
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1, "duplicate must not be delivered twice");
}

#[tokio::test]
async fn s3_reconnect_preserves_id_and_restarts_apps() {
    let mut cfg = NetworkConfig::default();
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    registry.factories.register(
        0,
        Arc::new(CountingFactory { handled: handled.clone(), started: started.clone() }),
    );

    let mut stream = TcpStream::connect(addr).await.unwrap();
    login(&mut stream, "device-c").await;

    // Create an app instance so we have something whose start() we can count.
    let frame = Frame::new_data(1, false, &[0, 0, 1], b"1").unwrap();
    let mut buf = vec![0u8; frame.wire_len()];
    frame.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = registry.get_client("device-c").expect("client object survives a dropped connection");
    assert!(!client.is_connected());

    let mut stream2 = TcpStream::connect(addr).await.unwrap();
    login(&mut stream2, "device-c").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(client.is_connected());
    assert_eq!(started.load(Ordering::SeqCst), 2, "reconnect must call start() again");
}

#[tokio::test]
async fn rapid_reconnect_does_not_let_the_old_connection_clobber_the_new_one() {
    // Regression test: a reconnect that arrives before the old socket's
    // reader task has unwound must not let that old task's eventual
    // `detach_transport` clear the freshly attached transport out from
    // under the new connection.
    let mut cfg = NetworkConfig::default();
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;
    registry.factories.register(0, Arc::new(EchoFactory));

    let mut stream1 = TcpStream::connect(addr).await.unwrap();
    login(&mut stream1, "device-race").await;

    // stream1 stays open (not dropped) so its reader task is still live,
    // parked on `client.superseded().notified()`, when stream2 logs in.
    let mut stream2 = TcpStream::connect(addr).await.unwrap();
    login(&mut stream2, "device-race").await;

    // Give the old connection's task time to wake on `superseded`, break
    // its loop, and run its (now-suppressed) `detach_transport`.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = registry.get_client("device-race").unwrap();
    assert!(client.is_connected(), "the new connection must still be attached");

    let frame = Frame::new_data(1, false, &[0, 0, 1], b"\"hi\"").unwrap();
    let mut buf = vec![0u8; frame.wire_len()];
    frame.encode(&mut buf).unwrap();
    stream2.write_all(&buf).await.unwrap();
    let line = read_frame(&mut stream2).await;
    let decoded = match Frame::decode(&line).unwrap() {
        Line::Frame(f) => f,
        Line::Keepalive => panic!("expected echoed frame"),
    };
    assert_eq!(decoded.payload, b"\"hi\"", "the new connection must still be able to send/receive");

    drop(stream1);
}

#[tokio::test]
async fn s4_ttl_expiry_removes_the_client_object() {
    let mut cfg = NetworkConfig::default().with_timeout_object_s(Some(0));
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = stream;
    login(&mut stream, "device-d").await;
    drop(stream);

    // 0s TTL + the fixed ~3s eviction grace.
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(registry.get_client("device-d").is_none(), "evicted client must leave the registry");
}

#[tokio::test]
async fn s5_sequence_numbers_increase_in_acquisition_order() {
    let mut cfg = NetworkConfig::default();
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;
    registry.factories.register(0, Arc::new(EchoFactory));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    login(&mut stream, "device-e").await;

    for expected_seq in 1..=5u8 {
        let frame = Frame::new_data(expected_seq, false, &[0, 0, 1], b"1").unwrap();
        let mut buf = vec![0u8; frame.wire_len()];
        frame.encode(&mut buf).unwrap();
        stream.write_all(&buf).await.unwrap();

        let line = read_frame(&mut stream).await;
        let echoed = match Frame::decode(&line).unwrap() {
            Line::Frame(f) => f,
            Line::Keepalive => panic!("expected echo"),
        };
        assert_eq!(echoed.seq, expected_seq, "seq assigned to the Nth write must be N (never 0)");
    }
}

#[tokio::test]
async fn s6_broadcast_reports_per_target_success() {
    let mut cfg = NetworkConfig::default();
    cfg.port = 0;
    let (registry, addr) = start_server(cfg).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    login(&mut stream, "device-online").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ids = vec!["device-online".to_string(), "device-offline-1".to_string(), "device-offline-2".to_string()];
    let message = serde_json::json!([42, 1.0]);
    let results = registry
        .write_all(&ids, 0, 0, 1, &message, Some(Duration::from_millis(100)), true, false)
        .await;

    let as_map: std::collections::HashMap<_, _> = results.into_iter().collect();
    assert_eq!(as_map.get("device-online"), Some(&true));
    assert_eq!(as_map.get("device-offline-1"), Some(&false));
    assert_eq!(as_map.get("device-offline-2"), Some(&false));
}

#[tokio::test]
async fn write_timeout_is_distinguished_from_slot_wait_timeout() {
    // A write with only_with_connection=false on a never-connected client
    // blocks on the "not connected" wait, not the ACK wait; it must still
    // surface WriteTimeout rather than hang forever.
    let cfg = NetworkConfig::default();
    let registry = Registry::new(cfg);
    let client = registry.get_or_create_client("device-f", false).unwrap();
    let message = serde_json::json!("hi");
    let result = client
        .write_app(0, 0, 1, &message, Some(Duration::from_millis(30)), false, true)
        .await;
    assert_eq!(result, Err(Error::WriteTimeout));
}
