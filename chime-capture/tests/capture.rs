#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use chime_capture::bus::{BusEvent, EventBus, TOPIC_RECORDING_COMPLETED};
use chime_capture::capture::CaptureEngine;
use chime_capture::event::RawEvent;
use chime_capture::recording::{
    Recorder, RecordingOutput, RecordingRequest, RecordingSupervisorTask,
};
use chime_capture::storage::{DatabaseStorage, FileStorage, Storage};
use chime_capture_task::{ShutdownHandle, spawn_task};
use time::OffsetDateTime;

/// Stand-in for the live-view pipeline: writes a file of the requested size
/// into the live_view directory after a configurable delay.
struct FakeRecorder {
    media_root: Utf8PathBuf,
    file_size: usize,
    delay: Duration,
    calls: AtomicU32,
}

impl FakeRecorder {
    fn new(media_root: Utf8PathBuf, file_size: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            media_root,
            file_size,
            delay,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Recorder for FakeRecorder {
    async fn record(&self, request: RecordingRequest) -> anyhow::Result<RecordingOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        let dir = self.media_root.join(&request.device_id).join("live_view");
        tokio::fs::create_dir_all(&dir).await?;

        let timestamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let path = dir.join(format!("{timestamp}.mp4"));

        tokio::fs::write(&path, vec![0u8; self.file_size]).await?;

        Ok(RecordingOutput {
            path,
            size: self.file_size as u64,
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    media_root: Utf8PathBuf,
    engine: Arc<CaptureEngine>,
    bus: Arc<EventBus>,
    database: Arc<dyn Storage>,
    filesystem: Arc<dyn Storage>,
    shutdown_handle: ShutdownHandle,
    recorder: Arc<FakeRecorder>,
}

async fn harness(file_size: usize, delay: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let media_root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

    let database: Arc<dyn Storage> = Arc::new(DatabaseStorage::in_memory().await.unwrap());
    let filesystem: Arc<dyn Storage> = Arc::new(FileStorage::new(media_root.clone()));
    let storages = vec![Arc::clone(&database), Arc::clone(&filesystem)];

    let bus = Arc::new(EventBus::new());
    let engine = Arc::new(CaptureEngine::new(storages.clone(), Arc::clone(&bus)));

    let recorder = FakeRecorder::new(media_root.clone(), file_size, delay);

    let supervisor = RecordingSupervisorTask::new(
        Arc::clone(&bus),
        storages,
        Arc::clone(&recorder) as Arc<dyn Recorder>,
        media_root.clone(),
        Duration::from_secs(30),
        Duration::from_secs(20),
    );

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    spawn_task(supervisor, shutdown_signal).detach();

    // Let the supervisor subscribe before events start flowing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Harness {
        _dir: dir,
        media_root,
        engine,
        bus,
        database,
        filesystem,
        shutdown_handle,
        recorder,
    }
}

fn motion_event(id: &str, device_id: &str) -> RawEvent {
    let payload = serde_json::json!({
        "id": id,
        "kind": "motion",
        "created_at": "2024-01-01T00:00:00Z",
        "doorbot": {"id": device_id, "description": "Front"},
    });

    match payload {
        serde_json::Value::Object(map) => RawEvent::Generic(map),
        _ => unreachable!(),
    }
}

async fn wait_for_recording_completed(
    rx: &mut tokio::sync::broadcast::Receiver<BusEvent>,
) -> chime_capture::bus::RecordingCompleted {
    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for recording_completed")
        .expect("bus closed");

    match event {
        BusEvent::RecordingCompleted(completed) => completed,
        other => panic!("unexpected bus event: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn motion_triggers_a_recording_linked_in_every_storage() {
    let harness = harness(4096, Duration::from_millis(50)).await;
    let mut completed_rx = harness.bus.subscribe(TOPIC_RECORDING_COMPLETED);

    harness.engine.capture(&motion_event("evt-1", "dev-9")).await.unwrap();

    let completed = wait_for_recording_completed(&mut completed_rx).await;
    assert_eq!(completed.event_id.as_deref(), Some("evt-1"));
    assert!(completed.file_size >= 1000);

    // Raw recorder output under live_view/, keyed by timestamp.
    let live_view_dir = harness.media_root.join("dev-9").join("live_view");
    let live_files: Vec<_> = std::fs::read_dir(&live_view_dir).unwrap().collect();
    assert_eq!(live_files.len(), 1);

    // Canonical copy next to the event record.
    let canonical = harness.media_root.join("dev-9").join("motion").join("evt-1");
    let video = canonical.join("video.mp4");
    assert!(video.as_std_path().exists());
    assert!(std::fs::metadata(video.as_std_path()).unwrap().len() >= 1000);

    // Give the write-through a moment to land everywhere.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let from_fs = harness.filesystem.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(from_fs.has_video);
    assert_eq!(from_fs.video_path.as_deref(), Some(video.as_str()));

    let from_db = harness.database.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(from_db.has_video);
    assert_eq!(from_db.video_path.as_deref(), Some(video.as_str()));

    harness.shutdown_handle.signal();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_second_trigger_for_the_same_device_is_dropped() {
    let harness = harness(4096, Duration::from_millis(1200)).await;
    let mut completed_rx = harness.bus.subscribe(TOPIC_RECORDING_COMPLETED);

    harness.engine.capture(&motion_event("evt-1", "dev-9")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    // Recording still in flight for dev-9: this one must be dropped.
    harness.engine.capture(&motion_event("evt-2", "dev-9")).await.unwrap();

    let completed = wait_for_recording_completed(&mut completed_rx).await;
    assert_eq!(completed.event_id.as_deref(), Some("evt-1"));

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.recorder.calls.load(Ordering::SeqCst), 1);

    let first = harness.database.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(first.has_video);

    // The dropped trigger's event is persisted, but never gains a video.
    let second = harness.database.retrieve_event("evt-2").await.unwrap().unwrap();
    assert!(!second.has_video);
    assert!(second.video_path.is_none());

    harness.shutdown_handle.signal();
}

#[tokio::test(flavor = "multi_thread")]
async fn undersized_recordings_never_mark_the_event() {
    let harness = harness(10, Duration::from_millis(50)).await;
    let mut completed_rx = harness.bus.subscribe(TOPIC_RECORDING_COMPLETED);

    harness.engine.capture(&motion_event("evt-1", "dev-9")).await.unwrap();

    let completed = wait_for_recording_completed(&mut completed_rx).await;
    assert_eq!(completed.file_size, 10);

    let record = harness.database.retrieve_event("evt-1").await.unwrap().unwrap();
    assert!(!record.has_video);
    assert!(record.video_path.is_none());

    let canonical = harness.media_root.join("dev-9").join("motion").join("evt-1");
    assert!(!canonical.join("video.mp4").as_std_path().exists());

    harness.shutdown_handle.signal();
}

#[tokio::test(flavor = "multi_thread")]
async fn different_devices_record_concurrently() {
    let harness = harness(4096, Duration::from_millis(300)).await;
    let mut completed_rx = harness.bus.subscribe(TOPIC_RECORDING_COMPLETED);

    harness.engine.capture(&motion_event("evt-1", "dev-1")).await.unwrap();
    harness.engine.capture(&motion_event("evt-2", "dev-2")).await.unwrap();

    let first = wait_for_recording_completed(&mut completed_rx).await;
    let second = wait_for_recording_completed(&mut completed_rx).await;

    let mut ids = vec![first.event_id.unwrap(), second.event_id.unwrap()];
    ids.sort();
    assert_eq!(ids, vec!["evt-1".to_owned(), "evt-2".to_owned()]);
    assert_eq!(harness.recorder.calls.load(Ordering::SeqCst), 2);

    harness.shutdown_handle.signal();
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_events_do_not_start_a_second_recording() {
    let harness = harness(4096, Duration::from_millis(50)).await;
    let mut completed_rx = harness.bus.subscribe(TOPIC_RECORDING_COMPLETED);

    harness.engine.capture(&motion_event("evt-1", "dev-9")).await.unwrap();
    let _ = wait_for_recording_completed(&mut completed_rx).await;

    // The same notification delivered again: storages already hold the id.
    harness.engine.capture(&motion_event("evt-1", "dev-9")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.recorder.calls.load(Ordering::SeqCst), 1);

    harness.shutdown_handle.signal();
}
