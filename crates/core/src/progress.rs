//! Progress estimation for in-flight jobs.
//!
//! Providers rarely report real progress, so the UI shows a simulated
//! percentage derived purely from elapsed time. Kept as a pure function of
//! `(elapsed, expected)` with no shared mutable state.

use std::time::Duration;

/// Cap for simulated progress while the job is still in flight.
///
/// The last 5% is reserved for the terminal observation so a slow job never
/// appears "done" before the provider confirms it.
pub const IN_FLIGHT_CAP: u8 = 95;

/// Estimate progress (0..=95) from elapsed wall-clock time.
pub fn estimate(elapsed: Duration, expected: Duration) -> u8 {
    if expected.is_zero() {
        return IN_FLIGHT_CAP;
    }
    let ratio = elapsed.as_secs_f64() / expected.as_secs_f64();
    let pct = (ratio * 100.0).floor() as u64;
    pct.min(IN_FLIGHT_CAP as u64) as u8
}

/// Remaining seconds until the expected duration elapses, if any.
pub fn eta_seconds(elapsed: Duration, expected: Duration) -> Option<u64> {
    expected.checked_sub(elapsed).map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_and_capped() {
        let expected = Duration::from_secs(100);
        let mut last = 0;
        for s in 0..200 {
            let p = estimate(Duration::from_secs(s), expected);
            assert!(p >= last, "progress went backwards at {s}s");
            assert!(p <= IN_FLIGHT_CAP);
            last = p;
        }
        assert_eq!(last, IN_FLIGHT_CAP);
    }

    #[test]
    fn halfway_reads_fifty() {
        assert_eq!(
            estimate(Duration::from_secs(45), Duration::from_secs(90)),
            50
        );
    }

    #[test]
    fn eta_counts_down_to_none() {
        let expected = Duration::from_secs(30);
        assert_eq!(eta_seconds(Duration::from_secs(10), expected), Some(20));
        assert_eq!(eta_seconds(Duration::from_secs(31), expected), None);
    }
}
