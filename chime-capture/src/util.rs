use std::time::Duration;

use backoff::backoff::Backoff as _;
use chime_capture_task::ShutdownSignal;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const MAX_RETRIES: u32 = 3;

/// Deterministic exponential backoff bounded by a total attempt count.
///
/// Shared by ticket acquisition, the WebSocket handshake and live-view client
/// restarts: 2 s doubling up to 30 s, at most `max_retries` attempts overall.
pub struct Backoff {
    inner: backoff::ExponentialBackoff,
    attempts: u32,
    max_retries: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_BACKOFF, MAX_BACKOFF, MAX_RETRIES)
    }

    pub fn with_limits(initial: Duration, max: Duration, max_retries: u32) -> Self {
        let inner = backoff::ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };

        Self {
            inner,
            attempts: 1,
            max_retries,
        }
    }

    /// Number of the attempt currently underway (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_retries {
            return None;
        }

        self.attempts += 1;

        // max_elapsed_time is disabled, so this never returns None on its own.
        self.inner.next_backoff()
    }

    pub fn reset(&mut self) {
        self.attempts = 1;
        self.inner.reset();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps for `duration`, waking up early when the shutdown signal fires.
///
/// Returns true when the full duration elapsed, false on cancellation.
pub async fn sleep_cancellable(duration: Duration, shutdown_signal: &mut ShutdownSignal) -> bool {
    if shutdown_signal.is_signaled() {
        return false;
    }

    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = shutdown_signal.wait() => false,
    }
}
