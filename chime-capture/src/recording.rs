use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use chime_capture_task::{ChildTask, ShutdownSignal, Task};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};

use crate::bus::{self, BusEvent, EventBus, RecordingCompleted};
use crate::event::{self, EventKind, EventRecord};
use crate::storage::{self, Storage};

/// Files smaller than this are considered failed recordings and never
/// linked to their event.
pub const MIN_VIDEO_BYTES: u64 = 1000;

/// How long to wait for in-flight recordings when the daemon shuts down.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub device_id: String,
    pub event_id: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RecordingOutput {
    pub path: Utf8PathBuf,
    pub size: u64,
}

/// Seam through which the supervisor launches recordings; implemented by
/// the live-view client in production.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, request: RecordingRequest) -> anyhow::Result<RecordingOutput>;
}

struct RecordingDone {
    device_id: String,
    event_id: String,
    result: anyhow::Result<RecordingOutput>,
}

/// Reacts to triggering events by launching a live-view recording, with a
/// single-flight gate per device, and links the produced file back to the
/// triggering event in every storage.
pub struct RecordingSupervisorTask {
    bus: Arc<EventBus>,
    storages: Vec<Arc<dyn Storage>>,
    recorder: Arc<dyn Recorder>,
    media_root: Utf8PathBuf,
    ding_duration: Duration,
    motion_duration: Duration,
}

impl RecordingSupervisorTask {
    pub fn new(
        bus: Arc<EventBus>,
        storages: Vec<Arc<dyn Storage>>,
        recorder: Arc<dyn Recorder>,
        media_root: Utf8PathBuf,
        ding_duration: Duration,
        motion_duration: Duration,
    ) -> Self {
        Self {
            bus,
            storages,
            recorder,
            media_root,
            ding_duration,
            motion_duration,
        }
    }
}

#[async_trait]
impl Task for RecordingSupervisorTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "recording supervisor";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        supervisor_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn supervisor_task(
    supervisor: RecordingSupervisorTask,
    mut shutdown_signal: ShutdownSignal,
) -> anyhow::Result<()> {
    debug!("Task started");

    let mut ding_rx = supervisor.bus.subscribe(event::KIND_DING);
    let mut motion_rx = supervisor.bus.subscribe(event::KIND_MOTION);

    let (done_tx, mut done_rx) = mpsc::channel::<RecordingDone>(16);

    // device_id -> event_id of the recording in flight; mutated only here.
    let mut recording_slots: HashMap<String, String> = HashMap::new();
    let mut recordings: Vec<ChildTask<()>> = Vec::new();

    loop {
        recordings.retain(|task| !task.is_finished());

        tokio::select! {
            trigger = ding_rx.recv() => {
                if let Some(record) = trigger_record(trigger, event::KIND_DING) {
                    handle_trigger(
                        &supervisor,
                        &mut recording_slots,
                        &mut recordings,
                        &done_tx,
                        record,
                        supervisor.ding_duration,
                    );
                }
            }
            trigger = motion_rx.recv() => {
                if let Some(record) = trigger_record(trigger, event::KIND_MOTION) {
                    handle_trigger(
                        &supervisor,
                        &mut recording_slots,
                        &mut recordings,
                        &done_tx,
                        record,
                        supervisor.motion_duration,
                    );
                }
            }
            done = done_rx.recv() => {
                let Some(done) = done else {
                    warn!("All recording senders are dead");
                    break;
                };

                handle_completion(&supervisor, &mut recording_slots, done).await;
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    debug!(
        in_flight = recordings.len(),
        "Task is stopping; waiting for in-flight recordings",
    );

    // The live-view clients observe the same shutdown signal; give them a
    // bounded window to finalise their files, then abandon them.
    for task in recordings {
        if task.join_with_timeout(SHUTDOWN_DRAIN_TIMEOUT).await.is_none() {
            warn!("A recording did not finish in time, abandoning it");
        }
    }

    // Drain the completions that made it, so slots settle before exit.
    while let Ok(done) = done_rx.try_recv() {
        handle_completion(&supervisor, &mut recording_slots, done).await;
    }

    debug!("Task terminated");

    Ok(())
}

fn trigger_record(
    trigger: Result<BusEvent, broadcast::error::RecvError>,
    topic: &str,
) -> Option<Arc<EventRecord>> {
    match trigger {
        Ok(BusEvent::Event(record)) => Some(record),
        Ok(other) => {
            debug!(topic, ?other, "Ignoring unexpected bus payload");
            None
        }
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            warn!(topic, missed, "Supervisor lagged behind the event bus");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

fn handle_trigger(
    supervisor: &RecordingSupervisorTask,
    recording_slots: &mut HashMap<String, String>,
    recordings: &mut Vec<ChildTask<()>>,
    done_tx: &mpsc::Sender<RecordingDone>,
    record: Arc<EventRecord>,
    duration: Duration,
) {
    let device_id = record.device_id.clone();
    let event_id = record.id.clone();

    // Single-flight per device: a second trigger is dropped, never queued.
    if let Some(active_event) = recording_slots.get(&device_id) {
        info!(
            device.id = %device_id,
            event.id = %event_id,
            active_event.id = %active_event,
            "Recording already in progress for this device, dropping trigger",
        );
        return;
    }

    info!(
        device.id = %device_id,
        event.id = %event_id,
        event.kind = %record.kind,
        duration_seconds = duration.as_secs(),
        "Starting video recording",
    );

    recording_slots.insert(device_id.clone(), event_id.clone());

    let recorder = Arc::clone(&supervisor.recorder);
    let done_tx = done_tx.clone();

    recordings.push(ChildTask::spawn(async move {
        let request = RecordingRequest {
            device_id: device_id.clone(),
            event_id: event_id.clone(),
            duration,
        };

        let result = recorder.record(request).await;

        let _ = done_tx
            .send(RecordingDone {
                device_id,
                event_id,
                result,
            })
            .await;
    }));
}

async fn handle_completion(
    supervisor: &RecordingSupervisorTask,
    recording_slots: &mut HashMap<String, String>,
    done: RecordingDone,
) {
    match done.result {
        Ok(output) => {
            if let Err(error) = finalize_recording(supervisor, &done.event_id, &done.device_id, &output).await {
                error!(
                    error = format!("{error:#}"),
                    event.id = %done.event_id,
                    "Failed to finalise the recording",
                );
            }
        }
        Err(error) => {
            error!(
                error = format!("{error:#}"),
                device.id = %done.device_id,
                event.id = %done.event_id,
                "Recording failed",
            );
        }
    }

    if recording_slots.remove(&done.device_id).is_none() {
        // Every recording path must leave through here exactly once.
        warn!(device.id = %done.device_id, "Recording slot was already vacant; this is a bug");
    }
}

/// Links a finished recording to its event: copy the live-view file into the
/// event's canonical directory, flip `has_video`, and write the record
/// through to every storage.
async fn finalize_recording(
    supervisor: &RecordingSupervisorTask,
    event_id: &str,
    device_id: &str,
    output: &RecordingOutput,
) -> anyhow::Result<()> {
    info!(
        path = %output.path,
        size = output.size,
        event.id = %event_id,
        "Recording completed",
    );

    let exists = tokio::fs::try_exists(&output.path).await.unwrap_or(false);

    if !exists || output.size < MIN_VIDEO_BYTES {
        warn!(
            path = %output.path,
            size = output.size,
            "Recording output is missing or too small, leaving the event untouched",
        );

        supervisor.bus.emit(
            bus::TOPIC_RECORDING_COMPLETED,
            BusEvent::RecordingCompleted(RecordingCompleted {
                video_path: output.path.clone(),
                file_size: output.size,
                event_id: Some(event_id.to_owned()),
                device_id: device_id.to_owned(),
                timestamp: OffsetDateTime::now_utc(),
            }),
        );

        return Ok(());
    }

    // Recover the event's kind; when no storage knows the event, default to
    // motion and synthesise a minimal record.
    let mut record = match storage::retrieve_event_anywhere(&supervisor.storages, event_id).await {
        Some(record) => record,
        None => {
            warn!(event.id = %event_id, "Event not found in any storage, synthesising a record");
            EventRecord::synthesised(event_id, EventKind::Motion, device_id)
        }
    };

    let event_dir = supervisor
        .media_root
        .join(device_id)
        .join(record.kind.as_str())
        .join(event_id);

    tokio::fs::create_dir_all(&event_dir).await?;

    let video_path = event_dir.join("video.mp4");

    // Copy, not move: the live_view file stays as the recorder's output.
    tokio::fs::copy(&output.path, &video_path).await?;

    debug!(from = %output.path, to = %video_path, "Copied recording into the event directory");

    record.has_video = true;
    record.video_path = Some(video_path.to_string());

    let report = storage::save_event_everywhere(&supervisor.storages, &record).await;

    info!(
        event.id = %event_id,
        saved = report.saved,
        already_exists = report.already_exists,
        failed = report.failed,
        "Event updated with video information",
    );

    supervisor.bus.emit(
        bus::TOPIC_RECORDING_COMPLETED,
        BusEvent::RecordingCompleted(RecordingCompleted {
            video_path: video_path.clone(),
            file_size: output.size,
            event_id: Some(event_id.to_owned()),
            device_id: device_id.to_owned(),
            timestamp: OffsetDateTime::now_utc(),
        }),
    );

    Ok(())
}
