use std::env;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use cfg_if::cfg_if;
use url::Url;

use crate::sleep::SleepMode;

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const APPLICATION_DIR: &str = "Chime\\Capture";
    } else if #[cfg(target_os = "macos")] {
        const APPLICATION_DIR: &str = "chime-capture";
    } else {
        const APPLICATION_DIR: &str = "chime-capture";
    }
}

const DEFAULT_API_BASE_URL: &str = "https://app.ring.com";
const DEFAULT_CLIENT_API_BASE_URL: &str = "https://api.ring.com";
const DEFAULT_OAUTH_URL: &str = "https://oauth.ring.com/oauth/token";

const DEFAULT_TICKET_CHECK_INTERVAL_SECS: u64 = 1800;
const DEFAULT_DING_DURATION_SECS: u64 = 30;
const DEFAULT_MOTION_DURATION_SECS: u64 = 20;
const DEFAULT_WAKE_CHECK_INTERVAL_SECS: u64 = 15;

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = env::var("CHIME_CAPTURE_CONFIG_PATH") {
        Utf8PathBuf::from(config_path_env)
    } else {
        cfg_if! {
            if #[cfg(target_os = "windows")] {
                let program_data = env::var("ProgramData").expect("ProgramData env variable");
                Utf8PathBuf::from(program_data).join(APPLICATION_DIR)
            } else if #[cfg(target_os = "macos")] {
                Utf8PathBuf::from("/Library/Application Support").join(APPLICATION_DIR)
            } else {
                Utf8PathBuf::from("/etc").join(APPLICATION_DIR)
            }
        }
    }
}

/// Runtime configuration, resolved from the configuration file with all
/// defaults applied.
#[derive(Debug, Clone)]
pub struct Conf {
    pub api_base_url: Url,
    pub client_api_base_url: Url,
    pub oauth_url: Url,
    pub media_root: Utf8PathBuf,
    pub database_path: Utf8PathBuf,
    pub remote_storage_url: Option<Url>,
    pub token_cache_path: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub ticket_check_interval: std::time::Duration,
    pub ding_recording_duration: std::time::Duration,
    pub motion_recording_duration: std::time::Duration,
    pub wake_detection: bool,
    pub wake_check_interval: std::time::Duration,
    pub prevent_sleep: bool,
    pub sleep_mode: SleepMode,
    pub debug: dto::DebugConf,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let data_dir = get_data_dir();

        let api_base_url = conf_file
            .api_base_url
            .clone()
            .map(Ok)
            .unwrap_or_else(|| Url::parse(DEFAULT_API_BASE_URL))
            .context("invalid ApiBaseUrl")?;

        let client_api_base_url = conf_file
            .client_api_base_url
            .clone()
            .map(Ok)
            .unwrap_or_else(|| Url::parse(DEFAULT_CLIENT_API_BASE_URL))
            .context("invalid ClientApiBaseUrl")?;

        let oauth_url = conf_file
            .oauth_url
            .clone()
            .map(Ok)
            .unwrap_or_else(|| Url::parse(DEFAULT_OAUTH_URL))
            .context("invalid OAuthUrl")?;

        let media_root = conf_file
            .media_root
            .clone()
            .unwrap_or_else(|| data_dir.join("captured_media"));

        let database_path = conf_file
            .database_path
            .clone()
            .unwrap_or_else(|| data_dir.join("chime-capture.db"));

        let token_cache_path = conf_file
            .token_cache_path
            .clone()
            .unwrap_or_else(|| data_dir.join("token.json"));

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| data_dir.join("capture"));

        let sleep_mode = conf_file.sleep_mode.unwrap_or(dto::SleepModeConf::System);

        Ok(Conf {
            api_base_url,
            client_api_base_url,
            oauth_url,
            media_root,
            database_path,
            remote_storage_url: conf_file.remote_storage_url.clone(),
            token_cache_path,
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            ticket_check_interval: std::time::Duration::from_secs(
                conf_file
                    .ticket_check_interval_secs
                    .unwrap_or(DEFAULT_TICKET_CHECK_INTERVAL_SECS),
            ),
            ding_recording_duration: std::time::Duration::from_secs(
                conf_file
                    .ding_recording_duration_secs
                    .unwrap_or(DEFAULT_DING_DURATION_SECS),
            ),
            motion_recording_duration: std::time::Duration::from_secs(
                conf_file
                    .motion_recording_duration_secs
                    .unwrap_or(DEFAULT_MOTION_DURATION_SECS),
            ),
            wake_detection: conf_file.wake_detection.unwrap_or(true),
            wake_check_interval: std::time::Duration::from_secs(
                conf_file
                    .wake_check_interval_secs
                    .unwrap_or(DEFAULT_WAKE_CHECK_INTERVAL_SECS),
            ),
            prevent_sleep: conf_file.prevent_sleep.unwrap_or(true),
            sleep_mode: sleep_mode.into(),
            debug: conf_file.debug.clone().unwrap_or_default(),
        })
    }
}

/// Handle to the shared configuration.
#[derive(Clone, Debug)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

#[derive(Debug)]
struct ConfHandleInner {
    conf: Conf,
    conf_file: dto::ConfFile,
}

impl ConfHandle {
    /// Initializes the configuration handle, reading the configuration file
    /// from disk and writing a fresh one when none exists yet.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner { conf, conf_file }),
        })
    }

    #[doc(hidden)]
    pub fn mock(conf_file: dto::ConfFile) -> anyhow::Result<Self> {
        let conf = Conf::from_conf_file(&conf_file)?;
        Ok(Self {
            inner: Arc::new(ConfHandleInner { conf, conf_file }),
        })
    }

    pub fn get_conf(&self) -> Conf {
        self.inner.conf.clone()
    }

    pub fn get_conf_file(&self) -> dto::ConfFile {
        self.inner.conf_file.clone()
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("chime-capture.json")
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match std::fs::File::open(conf_path) {
        Ok(file) => {
            let conf_file = serde_json::from_reader(std::io::BufReader::new(file))
                .with_context(|| format!("invalid config file at {conf_path}"))?;
            Ok(Some(conf_file))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("couldn't open config file at {conf_path}")))
        }
    }
}

fn save_config_file(conf_file: &dto::ConfFile, conf_path: &Utf8Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(conf_file).context("failed JSON serialization of configuration")?;

    if let Some(parent) = conf_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create directory {parent}"))?;
    }

    std::fs::write(conf_path, json).with_context(|| format!("failed to write file at {conf_path}"))?;

    Ok(())
}

fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::default();
            save_config_file(&defaults, &conf_file_path)
                .context("failed to save configuration")?;
            defaults
        }
    };

    Ok(conf_file)
}

pub mod dto {
    use super::*;
    use serde::{Deserialize, Serialize};

    /// Verbosity profile (pre-defined tracing directives).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Turns off everything
        Quiet,
        /// Show all traces
        All,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,chime_capture=debug",
                VerbosityProfile::Quiet => "warn",
                VerbosityProfile::All => "trace",
            }
        }
    }

    /// Sleep prevention mode, as written in the configuration file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SleepModeConf {
        All,
        System,
        Disk,
        None,
    }

    impl From<SleepModeConf> for SleepMode {
        fn from(value: SleepModeConf) -> Self {
            match value {
                SleepModeConf::All => SleepMode::All,
                SleepModeConf::System => SleepMode::System,
                SleepModeConf::Disk => SleepMode::Disk,
                SleepModeConf::None => SleepMode::None,
            }
        }
    }

    /// Unsafe debug options that should only ever be used at development stage.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DebugConf {
        /// Directives string in the same form as the RUST_LOG environment variable
        pub log_directives: Option<String>,
        /// Overrides the signalling WebSocket endpoint (plain `ws://` allowed)
        pub signalling_url: Option<Url>,
    }

    impl DebugConf {
        pub fn is_default(&self) -> bool {
            *self == Self::default()
        }
    }

    /// Source configuration file format.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Base URL of the cloud application API (ticket endpoint)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_base_url: Option<Url>,
        /// Base URL of the cloud clients API (devices listing)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub client_api_base_url: Option<Url>,
        /// OAuth token endpoint used for bearer refresh
        #[serde(rename = "OAuthUrl", skip_serializing_if = "Option::is_none")]
        pub oauth_url: Option<Url>,
        /// Root directory for captured media
        #[serde(skip_serializing_if = "Option::is_none")]
        pub media_root: Option<Utf8PathBuf>,
        /// Path to the relational event index
        #[serde(skip_serializing_if = "Option::is_none")]
        pub database_path: Option<Utf8PathBuf>,
        /// Optional remote storage base URL
        #[serde(skip_serializing_if = "Option::is_none")]
        pub remote_storage_url: Option<Url>,
        /// Path to the bearer/refresh token cache
        #[serde(skip_serializing_if = "Option::is_none")]
        pub token_cache_path: Option<Utf8PathBuf>,
        /// Path to the log file or log directory
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,
        /// Interval between proactive signalling-ticket refreshes, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ticket_check_interval_secs: Option<u64>,
        /// Recording duration for doorbell presses, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ding_recording_duration_secs: Option<u64>,
        /// Recording duration for motion events, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub motion_recording_duration_secs: Option<u64>,
        /// Whether live-view clients watch for wake-from-sleep
        #[serde(skip_serializing_if = "Option::is_none")]
        pub wake_detection: Option<bool>,
        /// Interval between network reachability probes, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub wake_check_interval_secs: Option<u64>,
        /// Whether to prevent system sleep while running
        #[serde(skip_serializing_if = "Option::is_none")]
        pub prevent_sleep: Option<bool>,
        /// Sleep prevention mode
        #[serde(skip_serializing_if = "Option::is_none")]
        pub sleep_mode: Option<SleepModeConf>,
        /// (Unstable) debug options
        #[serde(skip_serializing_if = "Option::is_none")]
        pub debug: Option<DebugConf>,
    }
}
