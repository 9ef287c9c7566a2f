//! General time utility functions

use chrono;
use std::time::Duration;

/// Number of nanoseconds in a second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Longest duration produced by `seconds_to_duration`
pub const MAX_DURATION_S: f64 = u32::MAX as f64;

/// Convert a duration into a number of seconds, or `None` if overflow
pub fn duration_to_seconds(duration: chrono::Duration) -> Option<f64> {
    if let Some(ns) = duration.num_nanoseconds() {
        Some(ns as f64 / NANOS_PER_SECOND as f64)
    }
    else {
        None
    }
}

/// Convert a number of seconds into a duration without panicking.
///
/// Negative and NaN values give a zero duration, values above `MAX_DURATION_S` (including
/// infinity) are capped.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        Duration::from_secs(0)
    }
    else {
        Duration::from_secs_f64(seconds.min(MAX_DURATION_S))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duration_to_seconds() {
        assert_eq!(
            duration_to_seconds(chrono::Duration::milliseconds(1500)),
            Some(1.5)
        );
        assert_eq!(duration_to_seconds(chrono::Duration::max_value()), None);
    }

    #[test]
    fn test_seconds_to_duration() {
        assert_eq!(seconds_to_duration(1.5), Duration::from_millis(1500));
        assert_eq!(seconds_to_duration(-1.0), Duration::from_secs(0));
        assert_eq!(seconds_to_duration(std::f64::NAN), Duration::from_secs(0));
        assert_eq!(
            seconds_to_duration(std::f64::INFINITY),
            Duration::from_secs(u32::MAX as u64)
        );
    }
}
