use async_trait::async_trait;
use url::Url;

use crate::event::EventRecord;
use crate::storage::{SaveOutcome, Storage, StorageError, VideoMetadata, VideoSource};

/// Remote object storage speaking plain HTTP: `event.json` and `video.mp4`
/// are PUT under `<base>/<device_id>/<kind>/<event_id>/`.
///
/// PUT is idempotent on the remote end; the backend never assumes ordering
/// with respect to the other storages.
pub struct RemoteStorage {
    http: reqwest::Client,
    base_url: Url,
}

impl RemoteStorage {
    pub fn new(mut base_url: Url) -> Self {
        // `Url::join` treats a base without a trailing slash as a file,
        // dropping its last segment.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn object_url(&self, device_id: &str, kind: &str, event_id: &str, file: &str) -> Result<Url, StorageError> {
        self.base_url
            .join(&format!("{device_id}/{kind}/{event_id}/{file}"))
            .map_err(|e| StorageError::Other(anyhow::anyhow!("invalid object URL: {e}")))
    }

    async fn fetch_event(&self, url: Url) -> Result<Option<EventRecord>, StorageError> {
        let response = self.http.get(url).send().await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        let response = response.error_for_status()?;
        let record = response.json::<EventRecord>().await?;

        Ok(Some(record))
    }

    async fn put_event(&self, url: Url, record: &EventRecord) -> Result<(), StorageError> {
        self.http
            .put(url)
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// The layout is keyed by device and kind, which a bare event id does not
    /// give us; the record carries both, so remote lookups go through a
    /// well-known index object maintained on save.
    fn index_url(&self, event_id: &str) -> Result<Url, StorageError> {
        self.base_url
            .join(&format!(".index/{event_id}.json"))
            .map_err(|e| StorageError::Other(anyhow::anyhow!("invalid index URL: {e}")))
    }

    async fn lookup_location(&self, event_id: &str) -> Result<Option<(String, String)>, StorageError> {
        let response = self.http.get(self.index_url(event_id)?).send().await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        let response = response.error_for_status()?;
        let location = response.json::<serde_json::Value>().await?;

        let device_id = location.get("device_id").and_then(serde_json::Value::as_str);
        let kind = location.get("kind").and_then(serde_json::Value::as_str);

        match (device_id, kind) {
            (Some(device_id), Some(kind)) => Ok(Some((device_id.to_owned(), kind.to_owned()))),
            _ => Ok(None),
        }
    }

    async fn store_location(&self, record: &EventRecord) -> Result<(), StorageError> {
        self.http
            .put(self.index_url(&record.id)?)
            .json(&serde_json::json!({
                "device_id": record.device_id,
                "kind": record.kind.as_str(),
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn save_event(&self, record: &EventRecord) -> Result<SaveOutcome, StorageError> {
        let url = self.object_url(&record.device_id, record.kind.as_str(), &record.id, "event.json")?;

        let outcome = match self.fetch_event(url.clone()).await? {
            Some(existing) => {
                let mut merged = record.clone();
                merged.has_video = existing.has_video || record.has_video;
                merged.video_path = record.video_path.clone().or(existing.video_path);

                self.put_event(url, &merged).await?;

                SaveOutcome::AlreadyExists
            }
            None => {
                self.put_event(url, record).await?;
                SaveOutcome::Saved
            }
        };

        self.store_location(record).await?;

        Ok(outcome)
    }

    async fn retrieve_event(&self, event_id: &str) -> Result<Option<EventRecord>, StorageError> {
        let Some((device_id, kind)) = self.lookup_location(event_id).await? else {
            return Ok(None);
        };

        let url = self.object_url(&device_id, &kind, event_id, "event.json")?;
        self.fetch_event(url).await
    }

    async fn save_video(
        &self,
        event_id: &str,
        source: VideoSource,
        metadata: Option<&VideoMetadata>,
    ) -> Result<String, StorageError> {
        let location = match (
            metadata.and_then(|m| m.device_id.clone()),
            metadata.and_then(|m| m.event_type.clone()),
        ) {
            (Some(device_id), Some(kind)) => Some((device_id, kind)),
            _ => self.lookup_location(event_id).await?,
        };

        let (device_id, kind) = location.unwrap_or_else(|| ("unknown".to_owned(), "videos".to_owned()));

        let extension = metadata
            .and_then(|m| m.extension.as_deref())
            .unwrap_or("mp4");
        let url = self.object_url(&device_id, &kind, event_id, &format!("video.{extension}"))?;

        let body = match source {
            VideoSource::Bytes(bytes) => bytes,
            VideoSource::Path(path) => bytes::Bytes::from(tokio::fs::read(path.as_std_path()).await?),
            VideoSource::Url(reference) => {
                // Already hosted elsewhere, store the reference on the event.
                let event_url = self.object_url(&device_id, &kind, event_id, "event.json")?;
                if let Some(mut record) = self.fetch_event(event_url.clone()).await? {
                    record.has_video = true;
                    record.video_path = Some(reference.to_string());
                    self.put_event(event_url, &record).await?;
                }
                return Ok(reference.to_string());
            }
        };

        self.http
            .put(url.clone())
            .header("Content-Type", "video/mp4")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let event_url = self.object_url(&device_id, &kind, event_id, "event.json")?;
        if let Some(mut record) = self.fetch_event(event_url.clone()).await? {
            record.has_video = true;
            record.video_path = Some(url.to_string());
            self.put_event(event_url, &record).await?;
        }

        Ok(url.to_string())
    }

    async fn retrieve_video(&self, event_id: &str) -> Result<Option<String>, StorageError> {
        let Some(record) = self.retrieve_event(event_id).await? else {
            return Ok(None);
        };

        if record.has_video {
            return Ok(record.video_path);
        }

        Ok(None)
    }

    async fn close(&self) -> Result<(), StorageError> {
        // reqwest pools its connections; dropping the client is enough.
        Ok(())
    }
}
