use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::event::EventRecord;

pub const TOPIC_RECORDING_COMPLETED: &str = "recording_completed";

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RecordingCompleted {
    pub video_path: Utf8PathBuf,
    pub file_size: u64,
    pub event_id: Option<String>,
    pub device_id: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A normalised event was persisted; published under its kind.
    Event(Arc<EventRecord>),
    /// A live-view recording finished; published under `recording_completed`.
    RecordingCompleted(RecordingCompleted),
}

/// In-process event bus keyed by topic.
///
/// Topics are created lazily on first use, on either side: a topic with no
/// subscriber is still a valid emission target (the message is dropped), so
/// unknown event kinds surface for forward compatibility.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        self.sender(topic).subscribe()
    }

    /// Publishes `event` on `topic`, returning the number of subscribers
    /// that received it.
    pub fn emit(&self, topic: &str, event: BusEvent) -> usize {
        self.sender(topic).send(event).unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusEvent> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}
