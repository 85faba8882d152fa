//! Pluggable snapshot storage and the worker that drains captured events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{info, warn};

use crate::config::{Config, StorageMode};
use crate::events::{day_bucket, EventBus, FailureStage, SnapshotCaptured, SnapshotFailed, SnapshotStored};

/// Bounded wait for in-flight store jobs at shutdown.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub local_path: PathBuf,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub day: String,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub storage: String,
    pub stored_uri: String,
    /// Adapters that consumed the local file in place set this false.
    pub delete_local: bool,
}

/// Storage adapter contract. Implementations must be idempotent on retry;
/// the gateway itself never retries.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn store(&self, req: &StoreRequest) -> Result<StoredObject, StorageError>;
}

/// Filesystem adapter: copies snapshots into `<root>/<day>/<device>/`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl SnapshotStore for LocalStore {
    async fn store(&self, req: &StoreRequest) -> Result<StoredObject, StorageError> {
        let file_name = req
            .local_path
            .file_name()
            .ok_or_else(|| StorageError::Other("snapshot path has no file name".into()))?;
        let dest_dir = self.root.join(&req.day).join(&req.device_id);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(file_name);
        tokio::fs::copy(&req.local_path, &dest).await?;
        Ok(StoredObject {
            storage: "local".into(),
            stored_uri: format!("file://{}", dest.display()),
            delete_local: true,
        })
    }
}

/// HTTP object-store adapter: PUTs the snapshot under
/// `<endpoint>/<bucket>/<day>/<device>/<file>`.
pub struct ObjectStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl ObjectStore {
    pub fn new(endpoint: String, bucket: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
            token,
        }
    }
}

#[async_trait]
impl SnapshotStore for ObjectStore {
    async fn store(&self, req: &StoreRequest) -> Result<StoredObject, StorageError> {
        let file_name = req
            .local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::Other("snapshot path has no file name".into()))?;
        let url = format!(
            "{}/{}/{}/{}/{}",
            self.endpoint, self.bucket, req.day, req.device_id, file_name
        );
        let body = tokio::fs::read(&req.local_path).await?;
        let mut put = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body);
        if let Some(token) = &self.token {
            put = put.bearer_auth(token);
        }
        put.send().await?.error_for_status()?;
        Ok(StoredObject {
            storage: "s3".into(),
            stored_uri: url,
            delete_local: true,
        })
    }
}

pub fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    match cfg.storage_mode {
        StorageMode::Local => Ok(Arc::new(LocalStore::new(cfg.storage_local_dir.clone()))),
        StorageMode::Object => {
            let endpoint = cfg
                .object_store_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("STORAGE_MODE=s3 requires OBJECT_STORE_URL"))?;
            let bucket = cfg
                .object_store_bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("STORAGE_MODE=s3 requires OBJECT_STORE_BUCKET"))?;
            Ok(Arc::new(ObjectStore::new(
                endpoint,
                bucket,
                cfg.object_store_token.clone(),
            )))
        }
    }
}

/// Drain `snapshot:captured` into the storage adapter with bounded
/// concurrency, emitting exactly one of `stored` / `failed` per capture.
pub async fn run_storage_worker(
    bus: EventBus,
    store: Arc<dyn SnapshotStore>,
    concurrency: usize,
    delete_local: bool,
    use_device_tz: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = bus.subscribe_captured();
    let semaphore = Arc::new(Semaphore::new(concurrency));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => match event {
                Ok(event) => {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let bus = bus.clone();
                    let store = store.clone();
                    tokio::spawn(async move {
                        handle_captured(event, store, bus, delete_local, use_device_tz).await;
                        drop(permit);
                    });
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "storage worker lagged behind capture events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    if tokio::time::timeout(DRAIN_WAIT, semaphore.acquire_many(concurrency as u32))
        .await
        .is_err()
    {
        warn!("storage worker shut down with store jobs still in flight");
    }
}

async fn handle_captured(
    event: SnapshotCaptured,
    store: Arc<dyn SnapshotStore>,
    bus: EventBus,
    delete_local: bool,
    use_device_tz: bool,
) {
    let day = day_bucket(event.captured_at, event.tz_offset_hours, use_device_tz);
    let request = StoreRequest {
        local_path: event.local_path.clone(),
        device_id: event.device_id.clone(),
        payload_id: event.payload_id.clone(),
        captured_at: event.captured_at,
        day: day.clone(),
    };

    match store.store(&request).await {
        Ok(object) => {
            if delete_local && object.delete_local {
                if let Err(err) = tokio::fs::remove_file(&event.local_path).await {
                    warn!(path = %event.local_path.display(), error = %err,
                        "could not remove stored snapshot");
                }
            }
            info!(device = %event.device_id, uri = %object.stored_uri, "snapshot stored");
            metrics::counter!("rtsp_tunnel.snapshots.stored").increment(1);
            bus.publish_stored(SnapshotStored {
                captured: event,
                storage: object.storage,
                stored_uri: object.stored_uri,
                day,
            });
        }
        Err(err) => {
            // The local file is left behind on purpose so an operator can
            // re-ingest it.
            warn!(device = %event.device_id, error = %err, "snapshot store failed");
            metrics::counter!("rtsp_tunnel.snapshots.store_failed").increment(1);
            bus.publish_failed(SnapshotFailed {
                session_id: event.session_id,
                device_id: event.device_id,
                payload_id: event.payload_id,
                remote: event.remote,
                stage: FailureStage::Store,
                error: err.to_string(),
            });
        }
    }
}
