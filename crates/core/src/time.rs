//! Conversions between chrono timestamps and the `f64` seconds the
//! scheduling arithmetic works in.

use chrono::{DateTime, Duration, Utc};

/// Signed seconds from `from` to `to` (negative when `to` is earlier).
pub fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to.signed_duration_since(from);
    delta.num_milliseconds() as f64 / 1000.0
}

/// Convert fractional seconds into a chrono duration (millisecond precision).
/// Saturates at the representable range; NaN maps to zero.
pub fn duration_from_secs(secs: f64) -> Duration {
    let millis = (secs * 1000.0).round();
    if millis.is_nan() {
        return Duration::zero();
    }
    Duration::try_milliseconds(millis as i64).unwrap_or(if millis > 0.0 {
        Duration::MAX
    } else {
        Duration::MIN
    })
}

/// `at` plus `secs`, clamped to the latest representable instant.
pub fn after_secs(at: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    at.checked_add_signed(duration_from_secs(secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn secs_between_is_signed() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + Duration::seconds(90);
        assert_eq!(secs_between(a, b), 90.0);
        assert_eq!(secs_between(b, a), -90.0);
    }

    #[test]
    fn duration_round_trips_fractional_seconds() {
        assert_eq!(duration_from_secs(1.5), Duration::milliseconds(1500));
        assert_eq!(duration_from_secs(0.0), Duration::zero());
    }

    #[test]
    fn huge_offsets_saturate_instead_of_panicking() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(duration_from_secs(f64::INFINITY), Duration::MAX);
        assert_eq!(duration_from_secs(f64::NAN), Duration::zero());
        assert_eq!(after_secs(a, 1e15), DateTime::<Utc>::MAX_UTC);
        assert_eq!(after_secs(a, 60.0), a + Duration::seconds(60));
    }
}
