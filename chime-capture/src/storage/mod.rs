pub mod database;
pub mod filesystem;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::event::EventRecord;

pub use database::DatabaseStorage;
pub use filesystem::FileStorage;
pub use remote::RemoteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("this backend does not accept raw video bytes")]
    UnsupportedVideoSource,
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("database failure: {0}")]
    Database(#[from] libsql::Error),
    #[error("HTTP failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed stored record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SaveOutcome {
    Saved,
    AlreadyExists,
}

/// What to store for a recording: raw bytes, a local file, or a reference to
/// a video hosted elsewhere.
#[derive(Debug, Clone)]
pub enum VideoSource {
    Bytes(Bytes),
    Path(Utf8PathBuf),
    Url(Url),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_date: Option<String>,
}

/// A storage backend for event records and their videos.
///
/// `save_event` must be idempotent per record id: saving the same id twice
/// either updates the mutable fields (`has_video` only ever goes from false
/// to true, `video_path` is only ever filled in) or is a no-op — never a
/// duplicate.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn save_event(&self, record: &EventRecord) -> Result<SaveOutcome, StorageError>;

    async fn retrieve_event(&self, event_id: &str) -> Result<Option<EventRecord>, StorageError>;

    /// Stores a video for `event_id` and returns the URL or path under which
    /// it is reachable.
    async fn save_video(
        &self,
        event_id: &str,
        source: VideoSource,
        metadata: Option<&VideoMetadata>,
    ) -> Result<String, StorageError>;

    async fn retrieve_video(&self, event_id: &str) -> Result<Option<String>, StorageError>;

    /// Releases native handles. Idempotent.
    async fn close(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FanoutReport {
    pub saved: usize,
    pub already_exists: usize,
    pub failed: usize,
}

impl FanoutReport {
    /// The overall save succeeded iff at least one backend saved the record
    /// or already had it.
    pub fn succeeded(&self) -> bool {
        self.saved > 0 || self.already_exists > 0
    }
}

/// Saves `record` to every storage, one at a time. A failing backend never
/// rolls back the others.
pub async fn save_event_everywhere(storages: &[Arc<dyn Storage>], record: &EventRecord) -> FanoutReport {
    let mut report = FanoutReport::default();

    for storage in storages {
        match storage.save_event(record).await {
            Ok(SaveOutcome::Saved) => report.saved += 1,
            Ok(SaveOutcome::AlreadyExists) => report.already_exists += 1,
            Err(error) => {
                report.failed += 1;
                error!(
                    %error,
                    event.id = %record.id,
                    storage = storage.name(),
                    "Failed to save event",
                );
            }
        }
    }

    report
}

/// Finds `event_id` across storages; the first backend that knows it wins.
pub async fn retrieve_event_anywhere(
    storages: &[Arc<dyn Storage>],
    event_id: &str,
) -> Option<EventRecord> {
    for storage in storages {
        match storage.retrieve_event(event_id).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {}
            Err(error) => {
                warn!(
                    %error,
                    event.id = %event_id,
                    storage = storage.name(),
                    "Failed to retrieve event",
                );
            }
        }
    }

    None
}
