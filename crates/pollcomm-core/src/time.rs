//! Wall-clock helpers
//!
//! Timeouts are kept as microseconds since the UNIX epoch in an `i64`,
//! with `-1` meaning "not set".

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel for a disabled timeout.
pub const NO_TIMEOUT: i64 = -1;

/// Current date in microseconds since the UNIX epoch.
#[inline]
pub fn current_date_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Convert a duration to microseconds, saturating at `i64::MAX`.
#[inline]
pub fn duration_to_us(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_date_moves_forward() {
        let a = current_date_us();
        std::thread::sleep(Duration::from_millis(2));
        let b = current_date_us();
        assert!(b > a);
        assert!(a > 1_500_000_000_000_000);
    }

    #[test]
    fn test_duration_to_us() {
        assert_eq!(duration_to_us(Duration::from_millis(3)), 3_000);
        assert_eq!(duration_to_us(Duration::MAX), i64::MAX);
    }
}
