use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;

use crate::event::EventRecord;
use crate::storage::{SaveOutcome, Storage, StorageError, VideoMetadata, VideoSource};

const EVENT_FILE: &str = "event.json";
const METADATA_FILE: &str = "video_metadata.json";

/// Filesystem backend laying events out as
/// `<root>/<device_id>/<kind>/<event_id>/{event.json, video.mp4}`.
pub struct FileStorage {
    root: Utf8PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn event_dir(&self, record: &EventRecord) -> Utf8PathBuf {
        self.root
            .join(&record.device_id)
            .join(record.kind.as_str())
            .join(&record.id)
    }

    /// Events are keyed by id alone, so finding one means scanning the
    /// two fixed levels of the layout.
    async fn find_event_dir(&self, event_id: &str) -> Result<Option<Utf8PathBuf>, StorageError> {
        let mut devices = match fs::read_dir(&self.root).await {
            Ok(devices) => devices,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(device) = devices.next_entry().await? {
            if !device.file_type().await?.is_dir() {
                continue;
            }

            let mut kinds = fs::read_dir(device.path()).await?;
            while let Some(kind) = kinds.next_entry().await? {
                if !kind.file_type().await?.is_dir() {
                    continue;
                }

                let candidate = kind.path().join(event_id);
                if fs::try_exists(candidate.join(EVENT_FILE)).await? {
                    let candidate = Utf8PathBuf::from_path_buf(candidate)
                        .map_err(|p| StorageError::Other(anyhow::anyhow!("non-UTF-8 path: {}", p.display())))?;
                    return Ok(Some(candidate));
                }
            }
        }

        Ok(None)
    }

    async fn write_event_json(dir: &Utf8Path, record: &EventRecord) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(record)?;

        // Write-then-rename so readers never observe a torn event.json.
        let tmp = dir.join(".event.json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, dir.join(EVENT_FILE)).await?;

        Ok(())
    }

    async fn read_event_json(path: &Utf8Path) -> Result<EventRecord, StorageError> {
        let contents = fs::read(path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn save_event(&self, record: &EventRecord) -> Result<SaveOutcome, StorageError> {
        let dir = self.event_dir(record);
        fs::create_dir_all(&dir).await?;

        let event_path = dir.join(EVENT_FILE);

        if fs::try_exists(&event_path).await? {
            // Merge mutable fields into the stored record; has_video never
            // goes back to false.
            let existing = Self::read_event_json(&event_path).await?;

            let mut merged = record.clone();
            merged.has_video = existing.has_video || record.has_video;
            merged.video_path = record.video_path.clone().or(existing.video_path);

            Self::write_event_json(&dir, &merged).await?;

            return Ok(SaveOutcome::AlreadyExists);
        }

        Self::write_event_json(&dir, record).await?;

        Ok(SaveOutcome::Saved)
    }

    async fn retrieve_event(&self, event_id: &str) -> Result<Option<EventRecord>, StorageError> {
        match self.find_event_dir(event_id).await? {
            Some(dir) => Ok(Some(Self::read_event_json(&dir.join(EVENT_FILE)).await?)),
            None => Ok(None),
        }
    }

    async fn save_video(
        &self,
        event_id: &str,
        source: VideoSource,
        metadata: Option<&VideoMetadata>,
    ) -> Result<String, StorageError> {
        let dir = match (metadata.and_then(|m| m.device_id.as_ref()), metadata.and_then(|m| m.event_type.as_ref())) {
            (Some(device_id), Some(event_type)) => self.root.join(device_id).join(event_type).join(event_id),
            _ => match self.find_event_dir(event_id).await? {
                Some(dir) => dir,
                None => self.root.join("unknown").join("videos").join(event_id),
            },
        };

        fs::create_dir_all(&dir).await?;

        let extension = metadata
            .and_then(|m| m.extension.as_deref())
            .unwrap_or("mp4");
        let video_path = dir.join(format!("video.{extension}"));

        let stored_reference = match source {
            VideoSource::Bytes(bytes) => {
                fs::write(&video_path, &bytes).await?;
                video_path.to_string()
            }
            VideoSource::Path(source_path) => {
                fs::copy(&source_path, &video_path).await?;
                video_path.to_string()
            }
            // A URL is stored by reference only; no local copy is made.
            VideoSource::Url(url) => url.to_string(),
        };

        if let Some(metadata) = metadata {
            let json = serde_json::to_vec_pretty(metadata)?;
            fs::write(dir.join(METADATA_FILE), json).await?;
        }

        let event_path = dir.join(EVENT_FILE);
        if fs::try_exists(&event_path).await? {
            let mut record = Self::read_event_json(&event_path).await?;
            record.has_video = true;
            record.video_path = Some(stored_reference.clone());
            Self::write_event_json(&dir, &record).await?;
        }

        Ok(stored_reference)
    }

    async fn retrieve_video(&self, event_id: &str) -> Result<Option<String>, StorageError> {
        let Some(dir) = self.find_event_dir(event_id).await? else {
            return Ok(None);
        };

        let record = Self::read_event_json(&dir.join(EVENT_FILE)).await?;

        if record.has_video {
            if let Some(video_path) = record.video_path {
                return Ok(Some(video_path));
            }
        }

        let fallback = dir.join("video.mp4");
        if fs::try_exists(&fallback).await? {
            return Ok(Some(fallback.to_string()));
        }

        Ok(None)
    }

    async fn close(&self) -> Result<(), StorageError> {
        // Nothing to release; files are closed as they are written.
        Ok(())
    }
}
