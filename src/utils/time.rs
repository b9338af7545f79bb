use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
#[inline]
pub fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Converts a Duration to whole milliseconds, saturating at `u64::MAX`.
#[inline]
pub fn dur_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
