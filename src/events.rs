//! Typed in-process event bus for the snapshot pipeline.
//!
//! One broadcast topic per event variant so the storage worker and any
//! downstream notifier can be statically wired. Publishing never blocks and
//! drops silently when nobody is subscribed.

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Hello,
    Auth,
    Capture,
    Proxy,
    Store,
    Unknown,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Hello => "hello",
            FailureStage::Auth => "auth",
            FailureStage::Capture => "capture",
            FailureStage::Proxy => "proxy",
            FailureStage::Store => "store",
            FailureStage::Unknown => "unknown",
        }
    }
}

/// Emitted exactly once per successful ffmpeg exit.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCaptured {
    pub session_id: String,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub remote: String,
    pub local_path: PathBuf,
    pub captured_at: DateTime<Utc>,
    pub tz_offset_hours: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStored {
    #[serde(flatten)]
    pub captured: SnapshotCaptured,
    pub storage: String,
    pub stored_uri: String,
    pub day: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFailed {
    pub session_id: String,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub remote: String,
    pub stage: FailureStage,
    pub error: String,
}

#[derive(Clone)]
pub struct EventBus {
    captured: broadcast::Sender<SnapshotCaptured>,
    stored: broadcast::Sender<SnapshotStored>,
    failed: broadcast::Sender<SnapshotFailed>,
}

impl EventBus {
    pub fn new() -> Self {
        let (captured, _) = broadcast::channel(TOPIC_CAPACITY);
        let (stored, _) = broadcast::channel(TOPIC_CAPACITY);
        let (failed, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            captured,
            stored,
            failed,
        }
    }

    pub fn publish_captured(&self, event: SnapshotCaptured) {
        let _ = self.captured.send(event);
    }

    pub fn publish_stored(&self, event: SnapshotStored) {
        let _ = self.stored.send(event);
    }

    pub fn publish_failed(&self, event: SnapshotFailed) {
        let _ = self.failed.send(event);
    }

    pub fn subscribe_captured(&self) -> broadcast::Receiver<SnapshotCaptured> {
        self.captured.subscribe()
    }

    pub fn subscribe_stored(&self) -> broadcast::Receiver<SnapshotStored> {
        self.stored.subscribe()
    }

    pub fn subscribe_failed(&self) -> broadcast::Receiver<SnapshotFailed> {
        self.failed.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Day bucket (`YYYY-MM-DD`) for a capture instant.
///
/// When `use_device_tz` is set and the offset is inside `[-12, 14]` the day is
/// computed in the device's local time; anything else falls back to UTC.
pub fn day_bucket(at: DateTime<Utc>, tz_offset_hours: Option<i32>, use_device_tz: bool) -> String {
    let offset = match tz_offset_hours {
        Some(tz) if use_device_tz && (-12..=14).contains(&tz) => tz,
        _ => 0,
    };
    (at + ChronoDuration::hours(i64::from(offset)))
        .format("%Y-%m-%d")
        .to_string()
}
