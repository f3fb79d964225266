use chrono::Utc;

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}
