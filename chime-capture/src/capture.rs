use std::sync::Arc;

use anyhow::Context as _;

use crate::bus::{BusEvent, EventBus};
use crate::event::{self, RawEvent};
use crate::storage::{self, Storage};

/// Normalises raw events, fans them out to every configured storage, and
/// publishes them on the in-process bus under their kind.
pub struct CaptureEngine {
    storages: Vec<Arc<dyn Storage>>,
    bus: Arc<EventBus>,
}

impl CaptureEngine {
    pub fn new(storages: Vec<Arc<dyn Storage>>, bus: Arc<EventBus>) -> Self {
        Self { storages, bus }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn storages(&self) -> &[Arc<dyn Storage>] {
        &self.storages
    }

    /// Processes one raw event. The overall capture succeeds when at least
    /// one storage saved the record or already had it.
    pub async fn capture(&self, raw: &RawEvent) -> anyhow::Result<()> {
        let started = std::time::Instant::now();

        let record = event::normalise(raw).context("failed to normalise the raw event")?;

        info!(
            event.id = %record.id,
            event.kind = %record.kind,
            device.id = %record.device_id,
            device.name = %record.device_name,
            "Received event",
        );

        let report = storage::save_event_everywhere(&self.storages, &record).await;

        anyhow::ensure!(
            report.succeeded(),
            "every storage failed to save event {}",
            record.id
        );

        let processing_ms = started.elapsed().as_millis();

        if report.saved > 0 {
            info!(
                event.id = %record.id,
                storage_count = report.saved,
                time_ms = processing_ms,
                "Event processed and stored",
            );

            // Only fresh events trigger subscribers; replays of an id the
            // storages already hold must not start a second recording.
            let kind = record.kind.clone();
            let delivered = self.bus.emit(kind.as_str(), BusEvent::Event(Arc::new(record)));
            trace!(topic = %kind, delivered, "Event published");
        } else {
            info!(
                event.id = %record.id,
                time_ms = processing_ms,
                "Event already exists in storage",
            );
        }

        Ok(())
    }

    pub async fn close_storages(&self) {
        for storage in &self.storages {
            if let Err(error) = storage.close().await {
                warn!(%error, storage = storage.name(), "Error closing storage");
            }
        }
    }
}
