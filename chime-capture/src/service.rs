use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chime_capture_log::LoggerGuard;
use chime_capture_task::{ChildTask, ShutdownHandle, Task, spawn_task};
use tokio::runtime;

use crate::auth::{AuthProvider, CloudAuth};
use crate::bus::EventBus;
use crate::capture::CaptureEngine;
use crate::cloud::CloudClient;
use crate::config::{Conf, ConfHandle};
use crate::listener::{self, EventListenerTask, RawEventSender};
use crate::live_view::LiveViewRecorder;
use crate::log::CaptureLog;
use crate::recording::RecordingSupervisorTask;
use crate::sleep::{SleepMode, SleepPrevention};
use crate::storage::{DatabaseStorage, FileStorage, RemoteStorage, Storage};

pub const SERVICE_NAME: &str = "chime-capture";

const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub prevent_sleep: Option<bool>,
    pub sleep_mode: Option<SleepMode>,
}

/// Why the service loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGINT / Ctrl-C
    Interrupted,
    /// SIGTERM
    Terminated,
}

pub struct CaptureService {
    conf: Conf,
    _logger_guard: LoggerGuard,
}

impl CaptureService {
    pub fn load(conf_handle: &ConfHandle, overrides: CliOverrides) -> anyhow::Result<Self> {
        let mut conf = conf_handle.get_conf();

        if let Some(prevent_sleep) = overrides.prevent_sleep {
            conf.prevent_sleep = prevent_sleep;
        }
        if let Some(sleep_mode) = overrides.sleep_mode {
            conf.sleep_mode = sleep_mode;
        }

        let logger_guard = chime_capture_log::init::<CaptureLog>(
            &conf.log_file,
            conf.verbosity_profile.to_log_filter(),
            conf.debug.log_directives.as_deref(),
        )
        .context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        if !conf.debug.is_default() {
            warn!(
                ?conf.debug,
                "**DEBUG OPTIONS ARE ENABLED, PLEASE DO NOT USE IN PRODUCTION**",
            );
        }

        Ok(Self {
            conf,
            _logger_guard: logger_guard,
        })
    }

    /// Runs the daemon until SIGINT or SIGTERM, then shuts everything down:
    /// the event listener (10 s cap), every live-view client, the storages.
    pub fn run(self) -> anyhow::Result<StopReason> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf = self.conf;

        let reason = runtime.block_on(async move {
            let mut tasks = spawn_tasks(&conf).await?;

            info!("Application running");

            let reason = wait_for_shutdown_signal().await;

            info!(?reason, "Signal received, initiating graceful shutdown");

            tasks.shutdown_handle.signal();

            for (name, timeout, task) in tasks.inner.drain(..) {
                match task.join_with_timeout(timeout).await {
                    Some(Ok(Ok(()))) => trace!(task = name, "Task terminated gracefully"),
                    Some(Ok(Err(error))) => {
                        error!(task = name, error = format!("{error:#}"), "Task failed")
                    }
                    Some(Err(error)) => {
                        error!(task = name, %error, "Something went very wrong with a task")
                    }
                    None => warn!(task = name, "Task did not stop in time, abandoning it"),
                }
            }

            tasks.engine.close_storages().await;
            tasks.sleep_prevention.stop().await;

            info!("Cleanup complete, application stopped");

            Ok::<_, anyhow::Error>(reason)
        })?;

        runtime.shutdown_timeout(Duration::from_secs(3));

        Ok(reason)
    }
}

struct Tasks {
    inner: Vec<(&'static str, Duration, ChildTask<anyhow::Result<()>>)>,
    shutdown_handle: ShutdownHandle,
    engine: Arc<CaptureEngine>,
    sleep_prevention: SleepPrevention,
    /// Held so the listener keeps running even while no notification source
    /// is attached yet.
    _raw_event_tx: RawEventSender,
}

async fn spawn_tasks(conf: &Conf) -> anyhow::Result<Tasks> {
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let storages = build_storages(conf).await?;

    let cloud = CloudClient::new(conf.api_base_url.clone(), conf.client_api_base_url.clone());

    let auth: Arc<dyn AuthProvider> = Arc::new(CloudAuth::new(
        cloud.clone(),
        conf.oauth_url.clone(),
        conf.token_cache_path.clone(),
    ));

    // Startup authentication failure is fatal for the daemon.
    auth.authenticate().await.context("authentication failed")?;

    let bus = Arc::new(EventBus::new());
    let engine = Arc::new(CaptureEngine::new(storages.clone(), Arc::clone(&bus)));

    let recorder = Arc::new(
        LiveViewRecorder::builder()
            .auth(Arc::clone(&auth))
            .cloud(cloud)
            .media_root(conf.media_root.clone())
            .ticket_check_interval(conf.ticket_check_interval)
            .wake_detection(conf.wake_detection)
            .wake_check_interval(conf.wake_check_interval)
            .signalling_url(conf.debug.signalling_url.clone())
            .shutdown_signal(shutdown_signal.clone())
            .build(),
    );

    let supervisor = RecordingSupervisorTask::new(
        Arc::clone(&bus),
        storages,
        recorder,
        conf.media_root.clone(),
        conf.ding_recording_duration,
        conf.motion_recording_duration,
    );

    let (raw_event_tx, raw_event_rx) = listener::raw_event_channel();
    let event_listener = EventListenerTask::new(raw_event_rx, Arc::clone(&engine));

    let mut sleep_prevention = SleepPrevention::new(if conf.prevent_sleep {
        conf.sleep_mode
    } else {
        SleepMode::None
    });
    sleep_prevention.start();

    let mut tasks = Tasks {
        inner: Vec::new(),
        shutdown_handle,
        engine,
        sleep_prevention,
        _raw_event_tx: raw_event_tx,
    };

    tasks.inner.push((
        EventListenerTask::NAME,
        listener::LISTENER_STOP_TIMEOUT,
        spawn_task(event_listener, shutdown_signal.clone()),
    ));

    tasks.inner.push((
        RecordingSupervisorTask::NAME,
        TASK_DRAIN_TIMEOUT,
        spawn_task(supervisor, shutdown_signal),
    ));

    trace!("Tasks created");

    Ok(tasks)
}

async fn build_storages(conf: &Conf) -> anyhow::Result<Vec<Arc<dyn Storage>>> {
    if let Some(parent) = conf.database_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {parent}"))?;
    }

    tokio::fs::create_dir_all(&conf.media_root)
        .await
        .with_context(|| format!("failed to create directory {}", conf.media_root))?;

    let database = DatabaseStorage::open(&conf.database_path)
        .await
        .with_context(|| format!("failed to open the event index at {}", conf.database_path))?;

    let mut storages: Vec<Arc<dyn Storage>> = vec![
        Arc::new(database),
        Arc::new(FileStorage::new(conf.media_root.clone())),
    ];

    if let Some(remote_url) = &conf.remote_storage_url {
        storages.push(Arc::new(RemoteStorage::new(remote_url.clone())));
    }

    Ok(storages)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> StopReason {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install the SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => StopReason::Interrupted,
        _ = sigterm.recv() => StopReason::Terminated,
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> StopReason {
    let _ = tokio::signal::ctrl_c().await;
    StopReason::Interrupted
}
