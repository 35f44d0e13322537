//! Wall-clock milliseconds.
//!
//! Fragment mod-times and spool ages are plain epoch milliseconds; nothing
//! in the broker orders by wall time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time as milliseconds since the Unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
