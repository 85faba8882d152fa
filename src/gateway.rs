//! The gateway core: WebSocket accept loop, per-session state machine, and
//! lifecycle management for everything leadership gates.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::{self, DeviceAuthenticator};
use crate::capture::{resolve_camera_profile, run_snapshot, CaptureError, SnapshotRequest};
use crate::config::Config;
use crate::coordinator::CaptureCoordinator;
use crate::events::{EventBus, FailureStage, SnapshotCaptured, SnapshotFailed};
use crate::frame::{CommandError, DeviceCommand, GatewayCommand, TunnelFrame};
use crate::proxy::run_proxy_listener;
use crate::registry::CachedRegistry;
use crate::session::{sanitize_device_id, Outbound, Session, SessionPhase, SessionTable};
use crate::storage::{run_storage_worker, SnapshotStore};

/// WebSocket messages above this size are rejected by the protocol layer.
pub const MAX_WS_MESSAGE: usize = 8 * 1024 * 1024;

/// Bound on waiting for background tasks when stopping.
const STOP_WAIT: Duration = Duration::from_secs(6);

pub struct GatewayCtx {
    pub cfg: Arc<Config>,
    pub sessions: SessionTable,
    pub coordinator: Arc<CaptureCoordinator>,
    pub bus: EventBus,
    pub registry: Arc<CachedRegistry>,
    pub authenticator: DeviceAuthenticator,
    pub store: Arc<dyn SnapshotStore>,
}

pub struct Gateway {
    ctx: Arc<GatewayCtx>,
}

/// Handles for one leadership term. Dropping it does not stop anything;
/// call [`Gateway::stop`].
pub struct RunningGateway {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub ws_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
}

impl Gateway {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<CachedRegistry>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let ctx = Arc::new(GatewayCtx {
            cfg,
            sessions: Arc::new(dashmap::DashMap::new()),
            coordinator: Arc::new(CaptureCoordinator::new()),
            bus: EventBus::new(),
            authenticator: DeviceAuthenticator::new(registry.clone()),
            registry,
            store,
        });
        Self { ctx }
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    /// Bring up one leadership term: storage worker, then the public
    /// WebSocket listener, then the loopback proxy.
    pub async fn start(&self) -> anyhow::Result<RunningGateway> {
        let ctx = self.ctx.clone();
        let cfg = &ctx.cfg;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_storage_worker(
            ctx.bus.clone(),
            ctx.store.clone(),
            cfg.storage_concurrency,
            cfg.storage_delete_local,
            cfg.use_device_tz_offset,
            shutdown_rx.clone(),
        )));

        let ws_listener = TcpListener::bind(("0.0.0.0", cfg.ws_port))
            .await
            .with_context(|| format!("bind WebSocket port {}", cfg.ws_port))?;
        let ws_addr = ws_listener.local_addr()?;
        let tls = if cfg.ws_tls {
            Some(load_tls_acceptor(cfg)?)
        } else {
            None
        };
        tasks.push(tokio::spawn(run_ws_listener(
            ws_listener,
            tls,
            ctx.clone(),
            shutdown_rx.clone(),
        )));

        let proxy_listener = TcpListener::bind(("127.0.0.1", cfg.proxy_port))
            .await
            .with_context(|| format!("bind loopback proxy port {}", cfg.proxy_port))?;
        let proxy_addr = proxy_listener.local_addr()?;
        tasks.push(tokio::spawn(run_proxy_listener(
            proxy_listener,
            ctx.sessions.clone(),
            ctx.coordinator.clone(),
            shutdown_rx,
        )));

        info!(ws = %ws_addr, proxy = %proxy_addr, tls = cfg.ws_tls, "gateway listening");
        Ok(RunningGateway {
            shutdown_tx,
            tasks,
            ws_addr,
            proxy_addr,
        })
    }

    /// Tear a term down: stop accepting, close every session (aborting any
    /// in-flight capture), then wait bounded for the storage worker to drain.
    pub async fn stop(&self, running: RunningGateway) {
        let _ = running.shutdown_tx.send(true);

        let open: Vec<Arc<Session>> = self
            .ctx
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in open {
            close_session(&self.ctx, &session, "gateway stopping");
        }

        for task in running.tasks {
            if tokio::time::timeout(STOP_WAIT, task).await.is_err() {
                warn!("gateway task did not stop in time");
            }
        }
        self.ctx.sessions.clear();
        info!("gateway stopped");
    }
}

fn load_tls_acceptor(cfg: &Config) -> anyhow::Result<TlsAcceptor> {
    let cert_path = cfg.tls_cert.as_ref().context("WS_TLS=1 requires TLS_CERT")?;
    let key_path = cfg.tls_key.as_ref().context("WS_TLS=1 requires TLS_KEY")?;
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("read {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path).with_context(|| format!("read {}", key_path.display()))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("parse TLS_CERT")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parse TLS_KEY")?
        .context("TLS_KEY holds no private key")?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn run_ws_listener(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: Arc<GatewayCtx>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "WebSocket accept failed");
                        continue;
                    }
                };
                metrics::counter!("rtsp_tunnel.connections.accepted").increment(1);
                let ctx = ctx.clone();
                let tls = tls.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handshake_and_run(stream, peer, tls, ctx, shutdown).await;
                });
            }
        }
    }
}

async fn handshake_and_run(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: Arc<GatewayCtx>,
    shutdown: watch::Receiver<bool>,
) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_WS_MESSAGE);
    ws_config.max_frame_size = Some(MAX_WS_MESSAGE);

    match tls {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            match accept_async_with_config(tls_stream, Some(ws_config)).await {
                Ok(ws) => run_session(ws, peer, ctx, shutdown).await,
                Err(err) => debug!(%peer, error = %err, "WebSocket upgrade failed"),
            }
        }
        None => match accept_async_with_config(stream, Some(ws_config)).await {
            Ok(ws) => run_session(ws, peer, ctx, shutdown).await,
            Err(err) => debug!(%peer, error = %err, "WebSocket upgrade failed"),
        },
    }
}

async fn run_session<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    ctx: Arc<GatewayCtx>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (session, mut out_rx) = Session::new(peer.to_string());
    ctx.sessions.insert(session.id.clone(), session.clone());
    metrics::gauge!("rtsp_tunnel.sessions.active").increment(1.0);
    info!(session = %session.id, remote = %peer, "device connected");

    // Single writer task per session keeps the wire strictly ordered.
    let writer_id = session.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let message = match outbound {
                Outbound::Command(command) => Message::Text(command.to_string()),
                Outbound::Frame(frame) => Message::Binary(frame.encode()),
                Outbound::Shutdown => break,
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(session = %writer_id, "writer task ended");
    });

    session.send_command(GatewayCommand::Ready);

    let hello_deadline = tokio::time::sleep(ctx.cfg.hello_wait);
    tokio::pin!(hello_deadline);
    let mut closed = session.closed_watch();

    loop {
        let awaiting_hello = session.state().phase == SessionPhase::New;
        tokio::select! {
            _ = &mut hello_deadline, if awaiting_hello => {
                warn!(session = %session.id, "no HELLO before deadline");
                fail_session(&ctx, &session, FailureStage::Hello, "no HELLO before deadline");
                break;
            }
            _ = closed.changed() => break,
            _ = shutdown.changed() => {
                close_session(&ctx, &session, "gateway stopping");
                break;
            }
            incoming = ws_rx.next() => match incoming {
                None => break,
                Some(Err(err)) => {
                    debug!(session = %session.id, error = %err, "WebSocket receive failed");
                    break;
                }
                Some(Ok(Message::Text(line))) => {
                    if !handle_text(&ctx, &session, &line).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(raw))) => handle_binary(&session, &raw).await,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {} // ping/pong answered by the protocol layer
            }
        }
    }

    close_session(&ctx, &session, "connection ended");
    ctx.sessions.remove(&session.id);
    let _ = writer.await;
    metrics::gauge!("rtsp_tunnel.sessions.active").decrement(1.0);
    info!(session = %session.id, remote = %peer, "device disconnected");
}

/// Returns false when the session must stop reading.
async fn handle_text(ctx: &Arc<GatewayCtx>, session: &Arc<Session>, line: &str) -> bool {
    match DeviceCommand::parse(line) {
        Ok(None) => true,
        Ok(Some(DeviceCommand::Hello {
            payload_id,
            device_id,
        })) => handle_hello(ctx, session, payload_id, &device_id).await,
        Ok(Some(DeviceCommand::Auth {
            device_id,
            signature_b64,
        })) => handle_auth(ctx, session, &device_id, &signature_b64).await,
        Err(CommandError::BadHello) => {
            session.send_command(GatewayCommand::HelloFail("malformed".into()));
            fail_session(ctx, session, FailureStage::Hello, "malformed HELLO");
            false
        }
        Err(CommandError::BadAuth) => auth_failure(ctx, session, "malformed"),
    }
}

async fn handle_hello(
    ctx: &Arc<GatewayCtx>,
    session: &Arc<Session>,
    payload_id: Option<String>,
    raw_device_id: &str,
) -> bool {
    if session.state().phase != SessionPhase::New {
        debug!(session = %session.id, "repeated HELLO ignored");
        return true;
    }

    let device_id = sanitize_device_id(raw_device_id);
    let nonce = auth::new_nonce();
    {
        let mut state = session.state();
        state.device_id = device_id.clone();
        state.payload_id = payload_id;
        state.nonce = Some(nonce.clone());
        state.phase = SessionPhase::Helloed;
    }
    info!(session = %session.id, device = %device_id, "device announced");
    session.send_command(GatewayCommand::Challenge(nonce));

    let tz = ctx.registry.tz_offset_hours(&device_id).await;
    session.state().tz_offset_hours = tz;

    if !ctx.cfg.require_auth {
        grant_auth(ctx, session);
    }
    true
}

async fn handle_auth(
    ctx: &Arc<GatewayCtx>,
    session: &Arc<Session>,
    raw_device_id: &str,
    signature_b64: &str,
) -> bool {
    let (nonce, known_device) = {
        let state = session.state();
        (state.nonce.clone(), state.device_id.clone())
    };
    let Some(nonce) = nonce else {
        return auth_failure(ctx, session, "no_chal");
    };
    let device_id = sanitize_device_id(raw_device_id);
    if device_id != known_device {
        return auth_failure(ctx, session, "device_mismatch");
    }
    if ctx.authenticator.verify(&device_id, &nonce, signature_b64).await {
        grant_auth(ctx, session);
        true
    } else {
        auth_failure(ctx, session, "verify_failed")
    }
}

/// Mark the session authenticated and kick off the capture on the first
/// grant. Re-grants (auth disabled, device still sends AUTH) only re-ack.
fn grant_auth(ctx: &Arc<GatewayCtx>, session: &Arc<Session>) {
    let newly_authed = {
        let mut state = session.state();
        if state.closed {
            return;
        }
        let newly = !state.authed;
        state.authed = true;
        state.phase = SessionPhase::Authed;
        newly
    };
    session.send_command(GatewayCommand::AuthOk);
    if !newly_authed {
        return;
    }
    info!(session = %session.id, "session authenticated");
    metrics::counter!("rtsp_tunnel.sessions.authed").increment(1);
    if ctx.cfg.auto_capture {
        let ctx = ctx.clone();
        let session = session.clone();
        tokio::spawn(async move {
            run_capture_flow(ctx, session).await;
        });
    }
}

fn auth_failure(ctx: &Arc<GatewayCtx>, session: &Arc<Session>, reason: &str) -> bool {
    session.send_command(GatewayCommand::AuthFail(reason.into()));
    metrics::counter!("rtsp_tunnel.auth.failed").increment(1);
    if ctx.cfg.require_auth {
        fail_session(ctx, session, FailureStage::Auth, reason);
        false
    } else {
        debug!(session = %session.id, reason, "advisory auth failure");
        true
    }
}

async fn handle_binary(session: &Arc<Session>, raw: &[u8]) {
    match TunnelFrame::decode(raw) {
        Ok(TunnelFrame::DeviceData(payload)) => {
            // No bound loopback socket means the bytes are silently dropped.
            if let Some(tx) = session.proxy_sender() {
                let _ = tx.send(payload).await;
            }
        }
        Ok(frame) => {
            debug!(session = %session.id, ?frame, "unexpected control frame from device");
        }
        Err(err) => {
            debug!(session = %session.id, error = %err, "undecodable binary message");
        }
    }
}

async fn run_capture_flow(ctx: Arc<GatewayCtx>, session: Arc<Session>) {
    if !ctx.coordinator.reserve(&session.id) {
        warn!(session = %session.id, "capture slot busy");
        fail_session(
            &ctx,
            &session,
            FailureStage::Capture,
            "Global capture already in progress",
        );
        return;
    }
    session.state().capture_active = true;
    metrics::counter!("rtsp_tunnel.captures.started").increment(1);

    let device_id = session.state().device_id.clone();
    let sensors = ctx.registry.sensor_meta(&device_id).await;
    let profile = resolve_camera_profile(&sensors, &ctx.cfg);
    let request = SnapshotRequest::new(&device_id, &profile, &ctx.cfg, session.closed_watch());
    let result = run_snapshot(request).await;

    session.state().capture_active = false;
    ctx.coordinator.release();

    match result {
        Ok((local_path, captured_at)) => {
            info!(session = %session.id, device = %device_id,
                path = %local_path.display(), "snapshot captured");
            metrics::counter!("rtsp_tunnel.captures.completed").increment(1);
            let event = {
                let state = session.state();
                SnapshotCaptured {
                    session_id: session.id.clone(),
                    device_id: state.device_id.clone(),
                    payload_id: state.payload_id.clone(),
                    remote: session.remote.clone(),
                    local_path,
                    captured_at,
                    tz_offset_hours: state.tz_offset_hours,
                }
            };
            ctx.bus.publish_captured(event);
            close_session(&ctx, &session, "capture complete");
        }
        Err(CaptureError::Aborted) => {
            fail_session(&ctx, &session, FailureStage::Capture, "capture aborted");
        }
        Err(err) => {
            fail_session(&ctx, &session, FailureStage::Capture, &err.to_string());
        }
    }
}

fn fail_session(ctx: &Arc<GatewayCtx>, session: &Arc<Session>, stage: FailureStage, error: &str) {
    metrics::counter!("rtsp_tunnel.sessions.failed", "stage" => stage.as_str()).increment(1);
    let (device_id, payload_id) = {
        let state = session.state();
        (state.device_id.clone(), state.payload_id.clone())
    };
    warn!(session = %session.id, device = %device_id, stage = stage.as_str(), error,
        "session failed");
    ctx.bus.publish_failed(SnapshotFailed {
        session_id: session.id.clone(),
        device_id,
        payload_id,
        remote: session.remote.clone(),
        stage,
        error: error.into(),
    });
    close_session(ctx, session, error);
}

fn close_session(ctx: &Arc<GatewayCtx>, session: &Arc<Session>, reason: &str) {
    if !session.begin_close() {
        return;
    }
    ctx.sessions.remove(&session.id);
    debug!(session = %session.id, reason, "session closing");
}
