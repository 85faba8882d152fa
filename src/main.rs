use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::aio::ConnectionManager;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hyphen_rtsp_tunnel::config::Config;
use hyphen_rtsp_tunnel::gateway::{Gateway, RunningGateway};
use hyphen_rtsp_tunnel::leader::{spawn_leader, LeaderEvent};
use hyphen_rtsp_tunnel::registry::{CachedRegistry, HttpRegistry, Registry, StaticRegistry};
use hyphen_rtsp_tunnel::storage::build_store;

#[derive(Parser)]
#[command(name = "hyphen-rtsp-tunnel")]
#[command(about = "Secure RTSP snapshot tunnel gateway")]
struct Cli {
    /// Override WS_PORT
    #[arg(long)]
    ws_port: Option<u16>,
    /// Override PROXY_PORT
    #[arg(long)]
    proxy_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(port) = cli.ws_port {
        cfg.ws_port = port;
    }
    if let Some(port) = cli.proxy_port {
        cfg.proxy_port = port;
    }
    let cfg = Arc::new(cfg);

    info!(
        ws_port = cfg.ws_port,
        proxy_port = cfg.proxy_port,
        tls = cfg.ws_tls,
        require_auth = cfg.require_auth,
        auto_capture = cfg.auto_capture,
        storage = cfg.storage_mode.as_str(),
        "starting snapshot tunnel gateway"
    );

    if let Some(addr) = cfg.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("install Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let redis = match &cfg.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("parse REDIS_URL")?;
            let conn = ConnectionManager::new(client)
                .await
                .context("connect to Redis")?;
            info!(url = %url, "connected to shared cache");
            Some(conn)
        }
        None => None,
    };

    let registry: Arc<dyn Registry> = match &cfg.registry_url {
        Some(url) => Arc::new(HttpRegistry::new(url.clone())),
        None => {
            warn!("REGISTRY_URL not set; device metadata and certificates unavailable");
            Arc::new(StaticRegistry::new())
        }
    };
    let registry = Arc::new(CachedRegistry::new(
        registry,
        redis.clone(),
        cfg.registry_cache_ttl_seconds,
    ));
    let store = build_store(&cfg)?;
    let gateway = Gateway::new(cfg.clone(), registry, store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut leader = spawn_leader(redis, shutdown_rx);
    let mut sigterm = signal::unix::signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut running: Option<RunningGateway> = None;

    loop {
        tokio::select! {
            event = leader.events.recv() => match event {
                Some(LeaderEvent::Elected) => {
                    info!("elected leader, starting gateway");
                    match gateway.start().await {
                        Ok(handle) => running = Some(handle),
                        Err(err) => {
                            error!(error = %err, "gateway failed to start");
                            let _ = shutdown_tx.send(true);
                            leader.join().await;
                            return Err(err);
                        }
                    }
                }
                Some(LeaderEvent::Revoked) => {
                    warn!("leadership revoked, stopping gateway");
                    if let Some(handle) = running.take() {
                        gateway.stop(handle).await;
                    }
                }
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = running.take() {
        gateway.stop(handle).await;
    }
    leader.join().await;
    info!("shutdown complete");
    Ok(())
}
