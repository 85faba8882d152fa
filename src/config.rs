use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Selects the snapshot storage adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    Object,
}

impl StorageMode {
    fn from_env() -> Self {
        match env::var("STORAGE_MODE").unwrap_or_else(|_| "local".into()).as_str() {
            "s3" => StorageMode::Object,
            _ => StorageMode::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::Object => "s3",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_port: u16,
    pub ws_tls: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub proxy_port: u16,
    pub cam_user: String,
    pub cam_pass: String,
    pub rtsp_path: String,
    pub out_dir: PathBuf,
    pub auto_capture: bool,
    pub require_auth: bool,
    pub hello_wait: Duration,
    pub capture_timeout: Duration,
    pub storage_mode: StorageMode,
    pub storage_concurrency: usize,
    pub storage_delete_local: bool,
    pub use_device_tz_offset: bool,
    pub redis_url: Option<String>,
    pub registry_url: Option<String>,
    pub registry_cache_ttl_seconds: u64,
    pub storage_local_dir: PathBuf,
    pub object_store_url: Option<String>,
    pub object_store_bucket: Option<String>,
    pub object_store_token: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            ws_port: env_parse("WS_PORT", 7443),
            ws_tls: env_flag("WS_TLS", false),
            tls_cert: env::var("TLS_CERT").ok().map(PathBuf::from),
            tls_key: env::var("TLS_KEY").ok().map(PathBuf::from),
            proxy_port: env_parse("PROXY_PORT", 8554),
            cam_user: env::var("CAM_USER").unwrap_or_else(|_| "admin".into()),
            cam_pass: env::var("CAM_PASS").unwrap_or_default(),
            rtsp_path: env::var("RTSP_PATH").unwrap_or_else(|_| "/stream2".into()),
            out_dir: env::var("OUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("hyphen-rtsp-tunnel").join("snapshots")),
            auto_capture: env_flag("AUTO_CAPTURE", true),
            require_auth: env_flag("REQUIRE_AUTH", false),
            hello_wait: Duration::from_millis(env_parse("HELLO_WAIT_MS", 2_000)),
            capture_timeout: Duration::from_millis(env_parse("CAPTURE_TIMEOUT_MS", 45_000)),
            storage_mode: StorageMode::from_env(),
            storage_concurrency: env_parse("STORAGE_CONCURRENCY", 2),
            storage_delete_local: env_flag("STORAGE_DELETE_LOCAL", true),
            use_device_tz_offset: env_flag("USE_DEVICE_TZ_OFFSET", false),
            redis_url: env::var("REDIS_URL").ok(),
            registry_url: env::var("REGISTRY_URL").ok(),
            registry_cache_ttl_seconds: env_parse("REGISTRY_CACHE_TTL", 900),
            storage_local_dir: env::var("STORAGE_LOCAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("hyphen-rtsp-tunnel").join("store")),
            object_store_url: env::var("OBJECT_STORE_URL").ok(),
            object_store_bucket: env::var("OBJECT_STORE_BUCKET").ok(),
            object_store_token: env::var("OBJECT_STORE_TOKEN").ok(),
            metrics_addr: env::var("METRICS_ADDR").ok().and_then(|v| v.parse().ok()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_port: 7443,
            ws_tls: false,
            tls_cert: None,
            tls_key: None,
            proxy_port: 8554,
            cam_user: "admin".into(),
            cam_pass: String::new(),
            rtsp_path: "/stream2".into(),
            out_dir: env::temp_dir().join("hyphen-rtsp-tunnel").join("snapshots"),
            auto_capture: true,
            require_auth: false,
            hello_wait: Duration::from_millis(2_000),
            capture_timeout: Duration::from_millis(45_000),
            storage_mode: StorageMode::Local,
            storage_concurrency: 2,
            storage_delete_local: true,
            use_device_tz_offset: false,
            redis_url: None,
            registry_url: None,
            registry_cache_ttl_seconds: 900,
            storage_local_dir: env::temp_dir().join("hyphen-rtsp-tunnel").join("store"),
            object_store_url: None,
            object_store_bucket: None,
            object_store_token: None,
            metrics_addr: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}
