//! Device registry collaborator and its read-through cache.
//!
//! The registry itself is an external service; the gateway only sees three
//! typed lookups. Device and sensor rows are memoized in the shared Redis
//! cache for fifteen minutes. Credential material is never cached.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: String,
    #[serde(default)]
    pub tz_offset_hours: Option<i32>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Per-device sensor metadata, keyed by config name (`CAM_USER`, `CAM_PASS`,
/// `RTSP_PATH`, ...).
pub type SensorMap = HashMap<String, String>;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn lookup_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;
    async fn lookup_sensor_meta(&self, device_id: &str) -> Result<SensorMap>;
    async fn lookup_certificate(&self, device_id: &str) -> Result<Option<String>>;
}

/// Thin HTTP client against the registry service.
pub struct HttpRegistry {
    http: reqwest::Client,
    base: String,
}

impl HttpRegistry {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn lookup_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let url = format!("{}/devices/{}", self.base, urlencoding::encode(device_id));
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    async fn lookup_sensor_meta(&self, device_id: &str) -> Result<SensorMap> {
        let url = format!(
            "{}/devices/{}/sensors",
            self.base,
            urlencoding::encode(device_id)
        );
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(SensorMap::new());
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn lookup_certificate(&self, device_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/devices/{}/certificate",
            self.base,
            urlencoding::encode(device_id)
        );
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.text().await?))
    }
}

/// Fixed in-memory registry. Stands in for the real service in tests and when
/// no registry endpoint is configured.
#[derive(Default)]
pub struct StaticRegistry {
    devices: HashMap<String, DeviceRecord>,
    sensors: HashMap<String, SensorMap>,
    certificates: HashMap<String, String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, record: DeviceRecord) -> Self {
        self.devices.insert(record.identity.clone(), record);
        self
    }

    pub fn with_sensors(mut self, device_id: &str, sensors: SensorMap) -> Self {
        self.sensors.insert(device_id.to_string(), sensors);
        self
    }

    pub fn with_certificate(mut self, device_id: &str, pem: &str) -> Self {
        self.certificates
            .insert(device_id.to_string(), pem.to_string());
        self
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn lookup_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.get(device_id).cloned())
    }

    async fn lookup_sensor_meta(&self, device_id: &str) -> Result<SensorMap> {
        Ok(self.sensors.get(device_id).cloned().unwrap_or_default())
    }

    async fn lookup_certificate(&self, device_id: &str) -> Result<Option<String>> {
        Ok(self.certificates.get(device_id).cloned())
    }
}

fn device_key(device_id: &str) -> String {
    format!("rtsp-tunnel:device-id:{device_id}")
}

fn sensors_key(device_id: &str) -> String {
    format!("rtsp-tunnel:device-sensors:{device_id}")
}

/// Read-through cache over the registry. Lookup failures degrade to "no
/// metadata" and are never cached.
pub struct CachedRegistry {
    inner: Arc<dyn Registry>,
    cache: Option<ConnectionManager>,
    ttl_seconds: u64,
}

impl CachedRegistry {
    pub fn new(
        inner: Arc<dyn Registry>,
        cache: Option<ConnectionManager>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            inner,
            cache,
            ttl_seconds,
        }
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        let key = device_key(device_id);
        if let Some(hit) = self.cache_get::<DeviceRecord>(&key).await {
            return Some(hit);
        }
        match self.inner.lookup_device(device_id).await {
            Ok(Some(record)) => {
                self.cache_put(&key, &record).await;
                Some(record)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(device = %device_id, error = %err, "device lookup failed");
                None
            }
        }
    }

    pub async fn sensor_meta(&self, device_id: &str) -> SensorMap {
        let key = sensors_key(device_id);
        if let Some(hit) = self.cache_get::<SensorMap>(&key).await {
            return hit;
        }
        match self.inner.lookup_sensor_meta(device_id).await {
            Ok(map) => {
                self.cache_put(&key, &map).await;
                map
            }
            Err(err) => {
                warn!(device = %device_id, error = %err, "sensor lookup failed");
                SensorMap::new()
            }
        }
    }

    /// Uncached: stale credentials must never authenticate a device.
    pub async fn certificate(&self, device_id: &str) -> Result<Option<String>> {
        self.inner.lookup_certificate(device_id).await
    }

    /// Registered device time-zone offset, constrained to `[-12, 14]`.
    pub async fn tz_offset_hours(&self, device_id: &str) -> Option<i32> {
        self.device(device_id)
            .await
            .and_then(|d| d.tz_offset_hours)
            .filter(|tz| (-12..=14).contains(tz))
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.cache.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                debug!(%key, error = %err, "cache read failed");
                None
            }
        }
    }

    async fn cache_put<T: Serialize>(&self, key: &str, value: &T) {
        let Some(mut conn) = self.cache.clone() else {
            return;
        };
        let Ok(raw) = serde_json::to_string(value) else {
            return;
        };
        if let Err(err) = conn.set_ex::<_, _, ()>(key, raw, self.ttl_seconds).await {
            debug!(%key, error = %err, "cache write failed");
        }
    }
}
