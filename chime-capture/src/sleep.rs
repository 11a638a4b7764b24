use cfg_if::cfg_if;

/// Sleep prevention modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    /// Prevent idle, display, and disk sleep
    All,
    /// Prevent idle/system sleep but allow display sleep
    System,
    /// Prevent disk sleep only
    Disk,
    /// No prevention at all
    None,
}

/// Keeps the host awake while the daemon runs by holding a platform
/// inhibitor process (`caffeinate` on macOS, `systemd-inhibit` on Linux).
///
/// Treated as a collaborator: the service starts it at boot and stops it on
/// shutdown; failures are logged and never fatal.
pub struct SleepPrevention {
    mode: SleepMode,
    child: Option<tokio::process::Child>,
}

impl SleepPrevention {
    pub fn new(mode: SleepMode) -> Self {
        Self { mode, child: None }
    }

    pub fn is_active(&self) -> bool {
        self.child.is_some()
    }

    pub fn start(&mut self) {
        if self.child.is_some() || self.mode == SleepMode::None {
            return;
        }

        match spawn_inhibitor(self.mode) {
            Ok(Some(child)) => {
                info!(mode = ?self.mode, pid = child.id(), "Sleep prevention started");
                self.child = Some(child);
            }
            Ok(None) => {
                debug!("Sleep prevention is not supported on this platform");
            }
            Err(error) => {
                warn!(%error, "Failed to start sleep prevention");
            }
        }
    }

    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(error) = child.kill().await {
                warn!(%error, "Failed to stop the sleep prevention process");
            } else {
                info!("Sleep prevention stopped");
            }
        }
    }
}

cfg_if! {
    if #[cfg(target_os = "macos")] {
        fn spawn_inhibitor(mode: SleepMode) -> std::io::Result<Option<tokio::process::Child>> {
            // -i prevents idle sleep, -s system sleep on AC, -d display
            // sleep, -m disk sleep.
            let flags: &[&str] = match mode {
                SleepMode::All => &["-i", "-d", "-m", "-s"],
                SleepMode::System => &["-i", "-s"],
                SleepMode::Disk => &["-m"],
                SleepMode::None => return Ok(None),
            };

            let child = tokio::process::Command::new("caffeinate")
                .args(flags)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            Ok(Some(child))
        }
    } else if #[cfg(target_os = "linux")] {
        fn spawn_inhibitor(mode: SleepMode) -> std::io::Result<Option<tokio::process::Child>> {
            let what = match mode {
                SleepMode::All => "sleep:idle:handle-lid-switch",
                SleepMode::System => "sleep:idle",
                SleepMode::Disk => "sleep",
                SleepMode::None => return Ok(None),
            };

            let child = tokio::process::Command::new("systemd-inhibit")
                .arg(format!("--what={what}"))
                .arg("--who=chime-capture")
                .arg("--why=recording doorbell events")
                .arg("--mode=block")
                .args(["sleep", "infinity"])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            Ok(Some(child))
        }
    } else {
        fn spawn_inhibitor(_mode: SleepMode) -> std::io::Result<Option<tokio::process::Child>> {
            Ok(None)
        }
    }
}
