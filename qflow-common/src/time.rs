//! Wall-clock helpers shared by every component.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub type TimestampSeconds = u64;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = u64;

/// Current time, seconds since the Unix epoch.
pub fn now_seconds() -> TimestampSeconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

/// Current time, milliseconds since the Unix epoch.
pub fn now_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}
