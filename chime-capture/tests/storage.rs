#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use camino::Utf8PathBuf;
use chime_capture::event::{EventKind, EventRecord};
use chime_capture::storage::{
    self, DatabaseStorage, FileStorage, SaveOutcome, Storage, StorageError, VideoSource,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn sample_record(id: &str, kind: EventKind) -> EventRecord {
    let mut extra = serde_json::Map::new();
    extra.insert("state".to_owned(), serde_json::json!("ringing"));
    extra.insert("battery_level".to_owned(), serde_json::json!(71));

    EventRecord {
        id: id.to_owned(),
        kind,
        created_at: OffsetDateTime::parse("2024-01-01T00:00:00Z", &Rfc3339).unwrap(),
        device_id: "dev-9".to_owned(),
        device_name: "Front".to_owned(),
        has_video: false,
        video_path: None,
        answered: None,
        motion_detection_score: Some(0.42),
        requester: None,
        extra,
    }
}

fn tempdir_storage() -> (tempfile::TempDir, FileStorage) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, FileStorage::new(root))
}

#[tokio::test]
async fn filesystem_round_trips_records_with_extras() {
    let (_dir, storage) = tempdir_storage();
    let record = sample_record("evt-1", EventKind::Motion);

    let outcome = storage.save_event(&record).await.unwrap();
    assert_eq!(outcome, SaveOutcome::Saved);

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert_eq!(retrieved, record);
}

#[tokio::test]
async fn filesystem_double_save_is_idempotent() {
    let (_dir, storage) = tempdir_storage();
    let record = sample_record("evt-1", EventKind::Motion);

    assert_eq!(storage.save_event(&record).await.unwrap(), SaveOutcome::Saved);
    assert_eq!(
        storage.save_event(&record).await.unwrap(),
        SaveOutcome::AlreadyExists
    );

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert_eq!(retrieved, record);
}

#[tokio::test]
async fn filesystem_has_video_is_monotonic() {
    let (_dir, storage) = tempdir_storage();

    let mut record = sample_record("evt-1", EventKind::Motion);
    record.has_video = true;
    record.video_path = Some("/somewhere/video.mp4".to_owned());
    storage.save_event(&record).await.unwrap();

    // A later save without video must not clear the flag.
    let stale = sample_record("evt-1", EventKind::Motion);
    storage.save_event(&stale).await.unwrap();

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(retrieved.has_video);
    assert_eq!(retrieved.video_path.as_deref(), Some("/somewhere/video.mp4"));
}

#[tokio::test]
async fn filesystem_save_video_links_the_event() {
    let (_dir, storage) = tempdir_storage();
    let record = sample_record("evt-1", EventKind::Ding);
    storage.save_event(&record).await.unwrap();

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("clip.mp4");
    std::fs::write(&source, vec![0u8; 4096]).unwrap();

    let stored = storage
        .save_video(
            "evt-1",
            VideoSource::Path(Utf8PathBuf::from_path_buf(source).unwrap()),
            None,
        )
        .await
        .unwrap();

    assert!(stored.ends_with("video.mp4"));
    assert!(std::path::Path::new(&stored).exists());

    let video = storage.retrieve_video("evt-1").await.unwrap();
    assert_eq!(video.as_deref(), Some(stored.as_str()));

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(retrieved.has_video);
}

#[tokio::test]
async fn database_round_trips_records_with_extras() {
    let storage = DatabaseStorage::in_memory().await.unwrap();
    let record = sample_record("evt-1", EventKind::Motion);

    assert_eq!(storage.save_event(&record).await.unwrap(), SaveOutcome::Saved);

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert_eq!(retrieved, record);
}

#[tokio::test]
async fn database_double_save_does_not_duplicate() {
    let storage = DatabaseStorage::in_memory().await.unwrap();
    let record = sample_record("evt-1", EventKind::Ding);

    assert_eq!(storage.save_event(&record).await.unwrap(), SaveOutcome::Saved);
    assert_eq!(
        storage.save_event(&record).await.unwrap(),
        SaveOutcome::AlreadyExists
    );

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert_eq!(retrieved, record);
}

#[tokio::test]
async fn database_has_video_is_monotonic() {
    let storage = DatabaseStorage::in_memory().await.unwrap();

    let mut record = sample_record("evt-1", EventKind::Motion);
    record.has_video = true;
    record.video_path = Some("/captures/video.mp4".to_owned());
    storage.save_event(&record).await.unwrap();

    let stale = sample_record("evt-1", EventKind::Motion);
    storage.save_event(&stale).await.unwrap();

    let retrieved = storage.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(retrieved.has_video);
    assert_eq!(retrieved.video_path.as_deref(), Some("/captures/video.mp4"));
}

#[tokio::test]
async fn database_refuses_raw_video_bytes() {
    let storage = DatabaseStorage::in_memory().await.unwrap();
    let record = sample_record("evt-1", EventKind::Motion);
    storage.save_event(&record).await.unwrap();

    let error = storage
        .save_video("evt-1", VideoSource::Bytes(bytes::Bytes::from_static(b"mp4")), None)
        .await
        .unwrap_err();

    assert!(matches!(error, StorageError::UnsupportedVideoSource));
}

#[tokio::test]
async fn database_stores_video_references() {
    let storage = DatabaseStorage::in_memory().await.unwrap();
    let record = sample_record("evt-1", EventKind::Motion);
    storage.save_event(&record).await.unwrap();

    let stored = storage
        .save_video("evt-1", VideoSource::Path("/captures/video.mp4".into()), None)
        .await
        .unwrap();
    assert_eq!(stored, "/captures/video.mp4");

    let video = storage.retrieve_video("evt-1").await.unwrap();
    assert_eq!(video.as_deref(), Some("/captures/video.mp4"));
}

#[tokio::test]
async fn retrieving_missing_events_yields_none() {
    let storage = DatabaseStorage::in_memory().await.unwrap();
    assert!(storage.retrieve_event("nope").await.unwrap().is_none());
    assert!(storage.retrieve_video("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn close_is_idempotent() {
    let (_dir, fs) = tempdir_storage();
    let db = DatabaseStorage::in_memory().await.unwrap();

    fs.close().await.unwrap();
    fs.close().await.unwrap();
    db.close().await.unwrap();
    db.close().await.unwrap();
}

struct FailingStorage;

#[async_trait::async_trait]
impl Storage for FailingStorage {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn save_event(&self, _record: &EventRecord) -> Result<SaveOutcome, StorageError> {
        Err(StorageError::Other(anyhow::anyhow!("backend down")))
    }

    async fn retrieve_event(&self, _event_id: &str) -> Result<Option<EventRecord>, StorageError> {
        Err(StorageError::Other(anyhow::anyhow!("backend down")))
    }

    async fn save_video(
        &self,
        _event_id: &str,
        _source: VideoSource,
        _metadata: Option<&chime_capture::storage::VideoMetadata>,
    ) -> Result<String, StorageError> {
        Err(StorageError::Other(anyhow::anyhow!("backend down")))
    }

    async fn retrieve_video(&self, _event_id: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Other(anyhow::anyhow!("backend down")))
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[tokio::test]
async fn fanout_succeeds_when_any_backend_accepts() {
    let (_dir, fs) = tempdir_storage();
    let storages: Vec<Arc<dyn Storage>> = vec![Arc::new(FailingStorage), Arc::new(fs)];

    let record = sample_record("evt-1", EventKind::Motion);
    let report = storage::save_event_everywhere(&storages, &record).await;

    assert_eq!(report.saved, 1);
    assert_eq!(report.failed, 1);
    assert!(report.succeeded());
}

#[tokio::test]
async fn fanout_fails_only_when_every_backend_fails() {
    let storages: Vec<Arc<dyn Storage>> = vec![Arc::new(FailingStorage), Arc::new(FailingStorage)];

    let record = sample_record("evt-1", EventKind::Motion);
    let report = storage::save_event_everywhere(&storages, &record).await;

    assert_eq!(report.failed, 2);
    assert!(!report.succeeded());
}

#[tokio::test]
async fn first_hit_wins_across_storages() {
    let (_dir, fs) = tempdir_storage();
    let db = DatabaseStorage::in_memory().await.unwrap();

    let record = sample_record("evt-1", EventKind::Ding);
    db.save_event(&record).await.unwrap();

    let storages: Vec<Arc<dyn Storage>> = vec![Arc::new(FailingStorage), Arc::new(db), Arc::new(fs)];

    let found = storage::retrieve_event_anywhere(&storages, "evt-1").await.unwrap();
    assert_eq!(found.id, "evt-1");
}
