//! Time utilities
//!
//! Wall-clock reads that never panic on a misconfigured system clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using 0 as timestamp");
            Duration::from_secs(0)
        })
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    since_epoch().as_millis() as u64
}
