//! # Seawall Common
//!
//! Shared utilities for the Seawall offline caching engine.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Retry with exponential backoff
//! - Timeout wrapper for async operations
//! - Epoch time helpers used by cache and queue bookkeeping

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig, TimeoutError};

/// Milliseconds since the Unix epoch.
///
/// Cache entries and queued mutations are stamped with this value, so it
/// only needs to be monotonic enough for age comparisons.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Age in milliseconds of a past `now_millis` stamp, saturating at zero.
pub fn millis_since(stamp: u64) -> u64 {
    now_millis().saturating_sub(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_advances() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }

    #[test]
    fn test_millis_since_saturates() {
        let future = now_millis() + 60_000;
        assert_eq!(millis_since(future), 0);
    }
}
