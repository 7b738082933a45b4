//! Time utilities for Nectar

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// A clock set before the Unix epoch yields 0 rather than panicking.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calculate elapsed time in milliseconds since a given timestamp.
///
/// Returns 0 if the given time is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_elapsed_millis() {
        let now = current_time_millis();
        std::thread::sleep(Duration::from_millis(10));
        assert!(elapsed_millis(now) >= 10);
    }

    #[test]
    fn test_elapsed_millis_future_time() {
        let future = current_time_millis() + 1_000_000;
        assert_eq!(elapsed_millis(future), 0);
    }
}
