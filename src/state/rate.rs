//! Counter diffing shared by the connection records and the rate monitor.

use chrono::{DateTime, Utc};

pub const DEFAULT_MAX_ELAPSED_SECS: f64 = 60.0;

/// `(current - previous) / elapsed`, or `None` when the sample cannot be
/// trusted: the counter went backwards (reset), no time passed, or so much
/// time passed that a tick was clearly missed.
pub fn rate_delta(previous: u64, current: u64, elapsed_secs: f64, max_elapsed_secs: f64) -> Option<f64> {
    if current < previous || elapsed_secs <= 0.0 || elapsed_secs > max_elapsed_secs {
        return None;
    }
    Some((current - previous) as f64 / elapsed_secs)
}

/// Same as [`rate_delta`] with untrusted samples reported as zero.
pub fn compute_rate(previous: u64, current: u64, elapsed_secs: f64, max_elapsed_secs: f64) -> f64 {
    rate_delta(previous, current, elapsed_secs, max_elapsed_secs).unwrap_or(0.0)
}

pub fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn rate_is_delta_over_elapsed() {
        assert_eq!(compute_rate(1_000, 3_000, 2.0, 60.0), 1_000.0);
        assert_eq!(compute_rate(5, 5, 1.0, 60.0), 0.0);
    }

    #[test]
    fn counter_reset_reports_zero_not_negative() {
        assert_eq!(rate_delta(10_000, 200, 1.0, 60.0), None);
        assert_eq!(compute_rate(10_000, 200, 1.0, 60.0), 0.0);
    }

    #[test]
    fn non_positive_or_implausible_elapsed_is_rejected() {
        assert_eq!(compute_rate(0, 100, 0.0, 60.0), 0.0);
        assert_eq!(compute_rate(0, 100, -1.0, 60.0), 0.0);
        assert_eq!(compute_rate(0, 100, 61.0, 60.0), 0.0);
        assert_eq!(compute_rate(0, 6_000, 60.0, 60.0), 100.0);
    }

    #[test]
    fn seconds_between_timestamps() {
        let t0 = Utc::now();
        assert_eq!(secs_between(t0, t0 + Duration::milliseconds(1500)), 1.5);
        assert_eq!(secs_between(t0 + Duration::seconds(1), t0), -1.0);
    }
}
