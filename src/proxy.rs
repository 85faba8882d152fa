//! Loopback RTSP proxy.
//!
//! The snapshot process dials `127.0.0.1:PROXY_PORT`; the accepted socket is
//! bound to the one session holding the capture slot and its bytes are framed
//! over that session's WebSocket in both directions. The listener is never
//! exposed beyond loopback.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::coordinator::CaptureCoordinator;
use crate::frame::TunnelFrame;
use crate::session::{Session, SessionTable};

const READ_CHUNK: usize = 16 * 1024;
const BIND_QUEUE: usize = 64;

pub async fn run_proxy_listener(
    listener: TcpListener,
    sessions: SessionTable,
    coordinator: Arc<CaptureCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "loopback accept failed");
                        continue;
                    }
                };
                let Some(session) = capturing_session(&sessions, &coordinator) else {
                    metrics::counter!("rtsp_tunnel.proxy.rejected").increment(1);
                    debug!(%peer, "no capture in flight, dropping loopback connection");
                    continue;
                };

                let (cam_tx, cam_rx) = mpsc::channel::<Bytes>(BIND_QUEUE);
                if session.bind_proxy(cam_tx.clone()).is_some() {
                    debug!(session = %session.id, "replaced a stale loopback binding");
                }
                session.send_frame(TunnelFrame::Open);
                info!(session = %session.id, %peer, "loopback socket bound");
                tokio::spawn(pump(stream, cam_rx, cam_tx, session));
            }
        }
    }
}

/// The session allowed to receive this socket: holder of the capture slot,
/// still open, still capturing.
fn capturing_session(
    sessions: &SessionTable,
    coordinator: &CaptureCoordinator,
) -> Option<Arc<Session>> {
    let session_id = coordinator.active_session()?;
    let session = sessions.get(&session_id)?.clone();
    {
        let state = session.state();
        if state.closed || !state.capture_active {
            return None;
        }
    }
    Some(session)
}

/// Bridge one loopback socket to the session's WebSocket until either side
/// closes. Camera-bound bytes arrive via the session's bound channel.
async fn pump(
    stream: TcpStream,
    mut cam_rx: mpsc::Receiver<Bytes>,
    cam_tx: mpsc::Sender<Bytes>,
    session: Arc<Session>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut closed = session.closed_watch();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    metrics::counter!("rtsp_tunnel.proxy.bytes_out").increment(n as u64);
                    session.send_frame(TunnelFrame::ProxyData(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(err) => {
                    debug!(session = %session.id, error = %err, "loopback read failed");
                    break;
                }
            },
            chunk = cam_rx.recv() => match chunk {
                Some(chunk) => {
                    metrics::counter!("rtsp_tunnel.proxy.bytes_in").increment(chunk.len() as u64);
                    if let Err(err) = writer.write_all(&chunk).await {
                        debug!(session = %session.id, error = %err, "loopback write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = closed.changed() => break,
        }
    }

    session.unbind_proxy_matching(&cam_tx);
    if !session.is_closed() {
        session.send_frame(TunnelFrame::Close);
    }
    debug!(session = %session.id, "loopback socket detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Outbound, SessionPhase};
    use dashmap::DashMap;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> TunnelFrame {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for outbound frame")
                .expect("session outbound channel closed")
            {
                Outbound::Frame(frame) => return frame,
                Outbound::Command(_) | Outbound::Shutdown => continue,
            }
        }
    }

    struct Fixture {
        sessions: SessionTable,
        coordinator: Arc<CaptureCoordinator>,
        port: u16,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn start_proxy() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sessions: SessionTable = Arc::new(DashMap::new());
        let coordinator = Arc::new(CaptureCoordinator::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_proxy_listener(
            listener,
            sessions.clone(),
            coordinator.clone(),
            shutdown_rx,
        ));
        Fixture {
            sessions,
            coordinator,
            port,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn accept_without_a_capture_drops_the_socket() {
        let fixture = start_proxy().await;
        let mut socket = TcpStream::connect(("127.0.0.1", fixture.port)).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .expect("socket should be closed promptly");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn bound_socket_tunnels_in_both_directions() {
        let fixture = start_proxy().await;
        let (session, mut out_rx) = Session::new("peer:1".into());
        {
            let mut state = session.state();
            state.phase = SessionPhase::Authed;
            state.capture_active = true;
        }
        fixture.sessions.insert(session.id.clone(), session.clone());
        assert!(fixture.coordinator.reserve(&session.id));

        let mut socket = TcpStream::connect(("127.0.0.1", fixture.port)).await.unwrap();
        assert_eq!(next_frame(&mut out_rx).await, TunnelFrame::Open);

        // capture process → device
        socket.write_all(b"DESCRIBE rtsp://cam RTSP/1.0\r\n").await.unwrap();
        match next_frame(&mut out_rx).await {
            TunnelFrame::ProxyData(payload) => {
                assert_eq!(&payload[..], b"DESCRIBE rtsp://cam RTSP/1.0\r\n");
            }
            other => panic!("expected proxy data, got {other:?}"),
        }

        // device → capture process
        let cam_tx = session.proxy_sender().expect("socket should be bound");
        cam_tx.send(Bytes::from_static(b"RTSP/1.0 200 OK\r\n")).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"RTSP/1.0 200 OK\r\n");

        // capture process hangs up → unbind + CLOSE toward the device
        drop(socket);
        assert_eq!(next_frame(&mut out_rx).await, TunnelFrame::Close);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.proxy_sender().is_none());
    }

    #[tokio::test]
    async fn closed_sessions_do_not_receive_sockets() {
        let fixture = start_proxy().await;
        let (session, _out_rx) = Session::new("peer:1".into());
        {
            let mut state = session.state();
            state.capture_active = true;
        }
        fixture.sessions.insert(session.id.clone(), session.clone());
        assert!(fixture.coordinator.reserve(&session.id));
        session.begin_close();

        let mut socket = TcpStream::connect(("127.0.0.1", fixture.port)).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .expect("socket should be closed promptly");
        assert_eq!(read.unwrap(), 0);
    }
}
