//! Indexation lag computation

use chrono::{DateTime, Utc};
use std::fmt;

use crate::types::TimestampUnit;

/// Upper bound of a lag we consider physically plausible (5 minutes)
pub const MAX_PLAUSIBLE_LAG_MS: i64 = 300_000;

/// Signed lag in milliseconds between the event and its arrival.
///
/// Negative when the local clock trails the aggregator's event time, or when
/// the timestamp unit is misinterpreted.
pub fn compute_lag_ms(event_timestamp: i64, unit: TimestampUnit, received_at: DateTime<Utc>) -> i64 {
    received_at
        .timestamp_millis()
        .saturating_sub(unit.to_millis(event_timestamp))
}

/// Whether a lag falls inside `0..=MAX_PLAUSIBLE_LAG_MS`
pub fn is_plausible(lag_ms: i64) -> bool {
    (0..=MAX_PLAUSIBLE_LAG_MS).contains(&lag_ms)
}

/// Coarse rating shown next to every lag in the logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyGrade {
    Excellent,
    Good,
    Medium,
    Slow,
}

impl LatencyGrade {
    pub fn from_lag_ms(lag_ms: i64) -> Self {
        match lag_ms {
            i64::MIN..=99 => LatencyGrade::Excellent,
            100..=299 => LatencyGrade::Good,
            300..=999 => LatencyGrade::Medium,
            _ => LatencyGrade::Slow,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LatencyGrade::Excellent => "Excellent",
            LatencyGrade::Good => "Good",
            LatencyGrade::Medium => "Medium",
            LatencyGrade::Slow => "Slow",
        }
    }
}

impl fmt::Display for LatencyGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at_secs(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_lag_seconds() {
        let lag = compute_lag_ms(1_700_000_000, TimestampUnit::Seconds, at_secs(1_700_000_003));
        assert_eq!(lag, 3000);
    }

    #[test]
    fn test_lag_milliseconds() {
        let lag = compute_lag_ms(1_700_000_002_750, TimestampUnit::Milliseconds, at_secs(1_700_000_003));
        assert_eq!(lag, 250);
    }

    #[test]
    fn test_negative_lag_is_kept() {
        let lag = compute_lag_ms(1_700_000_010, TimestampUnit::Seconds, at_secs(1_700_000_003));
        assert_eq!(lag, -7000);
        assert!(!is_plausible(lag));
    }

    #[test]
    fn test_misread_unit_is_implausible() {
        // A millisecond timestamp read as seconds lands far in the future
        let lag = compute_lag_ms(1_700_000_000_000, TimestampUnit::Seconds, at_secs(1_700_000_003));
        assert!(!is_plausible(lag));
    }

    #[test]
    fn test_plausibility_bounds() {
        assert!(is_plausible(0));
        assert!(is_plausible(MAX_PLAUSIBLE_LAG_MS));
        assert!(!is_plausible(MAX_PLAUSIBLE_LAG_MS + 1));
        assert!(!is_plausible(-1));
    }

    #[test]
    fn test_grades() {
        assert_eq!(LatencyGrade::from_lag_ms(-5), LatencyGrade::Excellent);
        assert_eq!(LatencyGrade::from_lag_ms(99), LatencyGrade::Excellent);
        assert_eq!(LatencyGrade::from_lag_ms(100), LatencyGrade::Good);
        assert_eq!(LatencyGrade::from_lag_ms(999), LatencyGrade::Medium);
        assert_eq!(LatencyGrade::from_lag_ms(1000), LatencyGrade::Slow);
    }

    proptest! {
        #[test]
        fn prop_lag_linear_in_seconds(ts in 1_000_000_000i64..2_000_000_000, now in 1_000_000_000i64..2_000_000_000) {
            let received = at_secs(now);
            let a = compute_lag_ms(ts, TimestampUnit::Seconds, received);
            let b = compute_lag_ms(ts + 1, TimestampUnit::Seconds, received);
            prop_assert_eq!(a - b, 1000);
        }

        #[test]
        fn prop_lag_linear_in_millis(ts in 1_000_000_000_000i64..2_000_000_000_000, now in 1_000_000_000i64..2_000_000_000) {
            let received = at_secs(now);
            let a = compute_lag_ms(ts, TimestampUnit::Milliseconds, received);
            let b = compute_lag_ms(ts + 1, TimestampUnit::Milliseconds, received);
            prop_assert_eq!(a - b, 1);
        }
    }
}
