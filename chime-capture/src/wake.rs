use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chime_capture_task::ChildTask;
use futures::future::BoxFuture;

/// Well-known DNS endpoints used as reachability probes.
const DEFAULT_PROBE_HOSTS: &[&str] = &["8.8.8.8:53", "1.1.1.1:53", "208.67.222.222:53"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub type WakeCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Detects "the system was asleep / the network was down" through periodic
/// TCP reachability checks.
///
/// An offline period longer than twice the check interval, entered through a
/// connectivity loss, is interpreted as the host having slept; regaining
/// connectivity afterwards fires the wake callbacks.
pub struct WakeMonitor {
    check_interval: Duration,
    probe_hosts: Vec<SocketAddr>,
    on_wake: Vec<WakeCallback>,
    on_sleep: Vec<WakeCallback>,
    task: Option<ChildTask<()>>,
}

impl WakeMonitor {
    pub fn new(check_interval: Duration) -> Self {
        let probe_hosts = DEFAULT_PROBE_HOSTS
            .iter()
            .filter_map(|host| host.parse().ok())
            .collect();

        Self::with_hosts(check_interval, probe_hosts)
    }

    pub fn with_hosts(check_interval: Duration, probe_hosts: Vec<SocketAddr>) -> Self {
        Self {
            check_interval,
            probe_hosts,
            on_wake: Vec::new(),
            on_sleep: Vec::new(),
            task: None,
        }
    }

    /// Registers a callback fired when a wake from sleep is detected.
    /// Must be called before `start`.
    pub fn on_wake<F, Fut>(&mut self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_wake.push(Box::new(move || {
            let future: BoxFuture<'static, ()> = Box::pin(callback());
            future
        }));
    }

    /// Registers a callback fired when the system appears to go to sleep.
    /// Must be called before `start`.
    pub fn on_sleep<F, Fut>(&mut self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_sleep.push(Box::new(move || {
            let future: BoxFuture<'static, ()> = Box::pin(callback());
            future
        }));
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let monitor = MonitorLoop {
            check_interval: self.check_interval,
            probe_hosts: self.probe_hosts.clone(),
            on_wake: std::mem::take(&mut self.on_wake),
            on_sleep: std::mem::take(&mut self.on_sleep),
        };

        self.task = Some(ChildTask::spawn(monitor.run()));
        info!("Wake monitor started");
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Wake monitor stopped");
        }
    }
}

struct MonitorLoop {
    check_interval: Duration,
    probe_hosts: Vec<SocketAddr>,
    on_wake: Vec<WakeCallback>,
    on_sleep: Vec<WakeCallback>,
}

impl MonitorLoop {
    async fn run(self) {
        let mut was_online = self.check_connectivity().await;
        let mut last_online = Instant::now();
        let mut sleep_suspected = false;

        loop {
            tokio::time::sleep(self.check_interval).await;

            let is_online = self.check_connectivity().await;

            if !was_online && is_online {
                let offline_duration = last_online.elapsed();

                if offline_duration > self.check_interval * 2 && sleep_suspected {
                    info!(
                        offline_seconds = offline_duration.as_secs(),
                        "System appears to have woken from sleep",
                    );
                    Self::fire(&self.on_wake, "wake").await;
                    sleep_suspected = false;
                } else {
                    info!(
                        offline_seconds = offline_duration.as_secs(),
                        "Network connection restored",
                    );
                }
            } else if was_online && !is_online {
                last_online = Instant::now();
                info!("Network connection lost, the system may be going to sleep");
                sleep_suspected = true;
                Self::fire(&self.on_sleep, "sleep").await;
            }

            was_online = is_online;

            if is_online {
                last_online = Instant::now();
            }
        }
    }

    async fn check_connectivity(&self) -> bool {
        for host in &self.probe_hosts {
            match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(host)).await {
                Ok(Ok(_stream)) => return true,
                Ok(Err(_)) | Err(_) => continue,
            }
        }

        false
    }

    /// A failing callback never prevents the remaining ones from running.
    async fn fire(callbacks: &[WakeCallback], which: &'static str) {
        for callback in callbacks {
            let future = std::panic::AssertUnwindSafe(callback());
            if let Err(panic) = futures::FutureExt::catch_unwind(future).await {
                error!(kind = which, ?panic, "A monitor callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn local_listener() -> (tokio::net::TcpListener, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        (listener, addr)
    }

    #[tokio::test]
    async fn short_outages_do_not_fire_wake_callbacks() {
        let (_listener, addr) = local_listener().await;

        let mut monitor = WakeMonitor::with_hosts(Duration::from_millis(50), vec![addr]);

        let wakes = Arc::new(AtomicU32::new(0));
        let wakes_clone = Arc::clone(&wakes);
        monitor.on_wake(move || {
            wakes_clone.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        monitor.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        monitor.stop().await;

        assert_eq!(wakes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_long_outage_is_reported_as_a_wake() {
        let (listener, addr) = local_listener().await;

        let mut monitor = WakeMonitor::with_hosts(Duration::from_millis(50), vec![addr]);

        let wakes = Arc::new(AtomicU32::new(0));
        let sleeps = Arc::new(AtomicU32::new(0));

        let wakes_clone = Arc::clone(&wakes);
        monitor.on_wake(move || {
            wakes_clone.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        let sleeps_clone = Arc::clone(&sleeps);
        monitor.on_sleep(move || {
            sleeps_clone.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        monitor.start();

        // Online first, then cut the network for well over 2x the interval.
        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(listener);
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Restore connectivity on the same address.
        let restored = tokio::net::TcpListener::bind(addr).await.expect("rebind");
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(restored);

        monitor.stop().await;

        assert_eq!(sleeps.load(Ordering::SeqCst), 1);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }
}
