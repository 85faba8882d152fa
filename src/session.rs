//! Per-connection session records and the process-wide session table.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::{mpsc, watch};

use crate::frame::{GatewayCommand, TunnelFrame};

pub type SessionTable = Arc<DashMap<String, Arc<Session>>>;

/// Messages queued toward a session's WebSocket writer task. Routing all
/// output through one queue keeps the wire sequence strictly ordered.
#[derive(Debug)]
pub enum Outbound {
    Command(GatewayCommand),
    Frame(TunnelFrame),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    New,
    Helloed,
    Authed,
    Closing,
}

#[derive(Debug)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub nonce: Option<String>,
    pub authed: bool,
    pub capture_active: bool,
    pub tz_offset_hours: Option<i32>,
    pub closed: bool,
}

pub struct Session {
    pub id: String,
    pub remote: String,
    out_tx: mpsc::UnboundedSender<Outbound>,
    state: Mutex<SessionState>,
    proxy_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(remote: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: new_session_id(),
            remote,
            out_tx,
            state: Mutex::new(SessionState {
                phase: SessionPhase::New,
                device_id: "unknown".into(),
                payload_id: None,
                nonce: None,
                authed: false,
                capture_active: false,
                tz_offset_hours: None,
                closed: false,
            }),
            proxy_tx: Mutex::new(None),
            closed_tx,
        });
        (session, out_rx)
    }

    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    /// Best-effort: the writer task may already be gone on a half-closed peer.
    pub fn send_command(&self, command: GatewayCommand) {
        let _ = self.out_tx.send(Outbound::Command(command));
    }

    pub fn send_frame(&self, frame: TunnelFrame) {
        let _ = self.out_tx.send(Outbound::Frame(frame));
    }

    /// Bind the accepted loopback socket's write channel to this session.
    /// Returns the previous binding, which the caller must tear down.
    pub fn bind_proxy(&self, tx: mpsc::Sender<Bytes>) -> Option<mpsc::Sender<Bytes>> {
        self.proxy_tx.lock().unwrap().replace(tx)
    }

    pub fn unbind_proxy(&self) -> Option<mpsc::Sender<Bytes>> {
        self.proxy_tx.lock().unwrap().take()
    }

    /// Unbind only if `tx` is still the current binding, so a stale pump
    /// cannot tear down its replacement.
    pub fn unbind_proxy_matching(&self, tx: &mpsc::Sender<Bytes>) -> bool {
        let mut guard = self.proxy_tx.lock().unwrap();
        match guard.as_ref() {
            Some(current) if current.same_channel(tx) => {
                guard.take();
                true
            }
            _ => false,
        }
    }

    pub fn proxy_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.proxy_tx.lock().unwrap().clone()
    }

    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Flip the session into `Closing`. Idempotent; returns true on the first
    /// call only. Drops the proxy binding, queues the device-facing CLOSE
    /// ahead of the WebSocket shutdown, and wakes every task watching for
    /// closure (capture watchdog, byte pump, reader loop).
    pub fn begin_close(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.phase = SessionPhase::Closing;
        }
        self.proxy_tx.lock().unwrap().take();
        let _ = self.closed_tx.send(true);
        let _ = self.out_tx.send(Outbound::Frame(TunnelFrame::Close));
        let _ = self.out_tx.send(Outbound::Shutdown);
        true
    }
}

fn new_session_id() -> String {
    let mut raw = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Restrict a device identifier to `[A-Za-z0-9._-]`, at most 64 chars.
/// Anything that sanitizes to nothing becomes `unknown`.
pub fn sanitize_device_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "unknown".into()
    } else {
        cleaned
    }
}
