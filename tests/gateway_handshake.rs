//! End-to-end protocol tests: a real WebSocket client against an in-process
//! gateway on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use hyphen_rtsp_tunnel::config::Config;
use hyphen_rtsp_tunnel::events::FailureStage;
use hyphen_rtsp_tunnel::gateway::{Gateway, RunningGateway};
use hyphen_rtsp_tunnel::registry::{CachedRegistry, Registry, StaticRegistry};
use hyphen_rtsp_tunnel::storage::{LocalStore, SnapshotStore};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
    gateway: Gateway,
    running: Option<RunningGateway>,
    _tmp: tempfile::TempDir,
}

impl TestGateway {
    async fn start(registry: StaticRegistry, tune: impl FnOnce(&mut Config)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            ws_port: 0,
            proxy_port: 0,
            auto_capture: false,
            hello_wait: Duration::from_millis(300),
            out_dir: tmp.path().join("snapshots"),
            storage_local_dir: tmp.path().join("store"),
            ..Config::default()
        };
        tune(&mut cfg);
        let store: Arc<dyn SnapshotStore> =
            Arc::new(LocalStore::new(cfg.storage_local_dir.clone()));
        let registry: Arc<dyn Registry> = Arc::new(registry);
        let registry = Arc::new(CachedRegistry::new(registry, None, 900));
        let gateway = Gateway::new(Arc::new(cfg), registry, store);
        let running = gateway.start().await.unwrap();
        Self {
            gateway,
            running: Some(running),
            _tmp: tmp,
        }
    }

    async fn connect(&self) -> WsClient {
        let port = self.running.as_ref().unwrap().ws_addr.port();
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .expect("connect to gateway");
        ws
    }

    async fn stop(mut self) {
        if let Some(running) = self.running.take() {
            self.gateway.stop(running).await;
        }
    }
}

async fn next_message(ws: &mut WsClient) -> Option<Message> {
    match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        Ok(_) => None,
        Err(_) => panic!("timed out waiting for a message"),
    }
}

async fn expect_text(ws: &mut WsClient) -> String {
    match next_message(ws).await {
        Some(Message::Text(text)) => text,
        other => panic!("expected a text message, got {other:?}"),
    }
}

fn device_keypair() -> (RsaPrivateKey, String) {
    let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
    let pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    (private, pem)
}

fn sign(private: &RsaPrivateKey, message: &str) -> String {
    let signer = SigningKey::<Sha256>::new(private.clone());
    BASE64.encode(signer.sign(message.as_bytes()).to_vec())
}

#[tokio::test]
async fn handshake_sequence_with_auth_disabled() {
    let gw = TestGateway::start(StaticRegistry::new(), |_| {}).await;
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO p1 devA".into())).await.unwrap();

    let chal = expect_text(&mut ws).await;
    let nonce = chal.strip_prefix("CHAL ").expect("challenge line");
    assert_eq!(BASE64.decode(nonce).unwrap().len(), 24);

    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    // tunnel data with no bound loopback socket is dropped silently
    ws.send(Message::Binary(vec![2, 0xde, 0xad])).await.unwrap();
    // unknown command lines are ignored
    ws.send(Message::Text("PING".into())).await.unwrap();

    ws.close(None).await.unwrap();
    gw.stop().await;
}

#[tokio::test]
async fn bad_signature_fails_and_closes_when_auth_is_required() {
    let (_private, pem) = device_keypair();
    let registry = StaticRegistry::new().with_certificate("devA", &pem);
    let gw = TestGateway::start(registry, |cfg| cfg.require_auth = true).await;
    let mut failed_rx = gw.gateway.bus().subscribe_failed();
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO p1 devA".into())).await.unwrap();
    assert!(expect_text(&mut ws).await.starts_with("CHAL "));

    ws.send(Message::Text("AUTH devA AAAA".into())).await.unwrap();
    assert_eq!(expect_text(&mut ws).await, "AUTH_FAIL verify_failed");

    // the session closes: CLOSE control frame, then the socket goes away
    loop {
        match next_message(&mut ws).await {
            Some(Message::Binary(raw)) => {
                assert_eq!(raw, vec![4]);
            }
            Some(Message::Close(_)) | None => break,
            Some(other) => panic!("unexpected message {other:?}"),
        }
    }

    let failed = tokio::time::timeout(Duration::from_secs(2), failed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.stage, FailureStage::Auth);
    assert_eq!(failed.device_id, "devA");
    gw.stop().await;
}

#[tokio::test]
async fn valid_signature_authenticates() {
    let (private, pem) = device_keypair();
    let registry = StaticRegistry::new().with_certificate("devA", &pem);
    let gw = TestGateway::start(registry, |cfg| cfg.require_auth = true).await;
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO devA".into())).await.unwrap();
    let chal = expect_text(&mut ws).await;
    let nonce = chal.strip_prefix("CHAL ").unwrap();

    let signature = sign(&private, &format!("devA.{nonce}"));
    ws.send(Message::Text(format!("AUTH devA {signature}")))
        .await
        .unwrap();
    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    ws.close(None).await.unwrap();
    gw.stop().await;
}

#[tokio::test]
async fn missing_hello_closes_the_session_at_the_deadline() {
    let gw = TestGateway::start(StaticRegistry::new(), |_| {}).await;
    let mut failed_rx = gw.gateway.bus().subscribe_failed();
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    let started = std::time::Instant::now();
    loop {
        match next_message(&mut ws).await {
            Some(Message::Close(_)) | None => break,
            Some(_) => continue,
        }
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    let failed = tokio::time::timeout(Duration::from_secs(2), failed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.stage, FailureStage::Hello);
    assert_eq!(failed.device_id, "unknown");
    gw.stop().await;
}

#[tokio::test]
async fn auth_before_hello_is_refused_with_no_chal() {
    let gw = TestGateway::start(StaticRegistry::new(), |_| {}).await;
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("AUTH devA AAAA".into())).await.unwrap();
    assert_eq!(expect_text(&mut ws).await, "AUTH_FAIL no_chal");

    // auth is advisory here, so the session is still usable
    ws.send(Message::Text("HELLO devA".into())).await.unwrap();
    assert!(expect_text(&mut ws).await.starts_with("CHAL "));
    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    ws.close(None).await.unwrap();
    gw.stop().await;
}

#[tokio::test]
async fn device_mismatch_is_refused() {
    let (private, pem) = device_keypair();
    let registry = StaticRegistry::new().with_certificate("devB", &pem);
    let gw = TestGateway::start(registry, |_| {}).await;
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO devA".into())).await.unwrap();
    let chal = expect_text(&mut ws).await;
    let nonce = chal.strip_prefix("CHAL ").unwrap();
    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    let signature = sign(&private, &format!("devB.{nonce}"));
    ws.send(Message::Text(format!("AUTH devB {signature}")))
        .await
        .unwrap();
    assert_eq!(expect_text(&mut ws).await, "AUTH_FAIL device_mismatch");

    ws.close(None).await.unwrap();
    gw.stop().await;
}

#[tokio::test]
async fn oversized_messages_terminate_the_connection() {
    let gw = TestGateway::start(StaticRegistry::new(), |_| {}).await;
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO devA".into())).await.unwrap();
    assert!(expect_text(&mut ws).await.starts_with("CHAL "));
    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    let mut oversized = vec![2u8];
    oversized.extend(std::iter::repeat(0u8).take(8 * 1024 * 1024 + 1));
    ws.send(Message::Binary(oversized)).await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "server should drop the connection");
    gw.stop().await;
}

#[tokio::test]
async fn auto_capture_without_credentials_fails_at_the_capture_stage() {
    let gw = TestGateway::start(StaticRegistry::new(), |cfg| {
        cfg.auto_capture = true;
        cfg.cam_pass = String::new();
    })
    .await;
    let mut failed_rx = gw.gateway.bus().subscribe_failed();
    let mut ws = gw.connect().await;

    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO p1 devA".into())).await.unwrap();
    assert!(expect_text(&mut ws).await.starts_with("CHAL "));
    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    let failed = tokio::time::timeout(Duration::from_secs(2), failed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.stage, FailureStage::Capture);
    assert_eq!(failed.error, "CAM_PASS required");
    assert_eq!(failed.payload_id.as_deref(), Some("p1"));
    gw.stop().await;
}

#[tokio::test]
async fn stopping_the_gateway_closes_open_sessions() {
    let gw = TestGateway::start(StaticRegistry::new(), |_| {}).await;
    let mut ws = gw.connect().await;
    assert_eq!(expect_text(&mut ws).await, "READY");
    ws.send(Message::Text("HELLO devA".into())).await.unwrap();
    assert!(expect_text(&mut ws).await.starts_with("CHAL "));
    assert_eq!(expect_text(&mut ws).await, "AUTH_OK");

    gw.stop().await;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client should observe the shutdown");
}
