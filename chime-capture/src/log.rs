use chime_capture_log::StaticLogConfig;

pub struct CaptureLog;

impl StaticLogConfig for CaptureLog {
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "capture";
}
