//! Utility functions
//!
//! **Why**: Logger setup and frame/time conversions shared by the workflows
//! and decoder backends

/// Initialize env_logger (default level `info`, millisecond timestamps).
///
/// For host applications; the library itself never installs a logger.
pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

/// Logger for tests: captured output, safe to call from every test
pub fn init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Frames to milliseconds at `fps`
pub fn frames_to_ms(frames: i64, fps: f64) -> i64 {
    if fps <= 0.0 {
        return 0;
    }
    (frames as f64 * 1000.0 / fps).round() as i64
}

/// Milliseconds to the nearest frame at `fps`
pub fn ms_to_frames(ms: i64, fps: f64) -> i64 {
    (ms as f64 * fps / 1000.0).round() as i64
}
