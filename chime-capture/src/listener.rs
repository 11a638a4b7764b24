use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chime_capture_task::{ShutdownSignal, Task};
use tokio::sync::mpsc;

use crate::capture::CaptureEngine;
use crate::event::RawEvent;

/// Stopping the listener is capped at this on shutdown; after that the task
/// is abandoned.
pub const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub type RawEventSender = mpsc::Sender<RawEvent>;
pub type RawEventReceiver = mpsc::Receiver<RawEvent>;

pub fn raw_event_channel() -> (RawEventSender, RawEventReceiver) {
    mpsc::channel(64)
}

/// Consumes raw push notifications from the notification transport and runs
/// them through the capture engine.
///
/// The transport itself (FCM or anything else) is a collaborator: it holds
/// the sending half of the channel.
pub struct EventListenerTask {
    rx: RawEventReceiver,
    engine: Arc<CaptureEngine>,
}

impl EventListenerTask {
    pub fn new(rx: RawEventReceiver, engine: Arc<CaptureEngine>) -> Self {
        Self { rx, engine }
    }
}

#[async_trait]
impl Task for EventListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "event listener";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                raw = self.rx.recv() => {
                    let Some(raw) = raw else {
                        info!("Notification source disconnected");
                        break;
                    };

                    if let Err(error) = self.engine.capture(&raw).await {
                        error!(error = format!("{error:#}"), "Event processing failed");
                    }
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}
