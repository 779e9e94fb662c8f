//! Small shared helpers that don't belong to any one module.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in seconds, clamped to 0 on clock errors rather
/// than panicking.
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| i64::try_from(duration.as_secs()).unwrap_or(0))
}
