use chrono::{DateTime, Duration, TimeZone, Utc};

/// Converts an NTFS filetime (100ns units since 1601-01-01 UTC) to a UTC
/// timestamp. Returns `None` if the value would overflow `chrono`'s range,
/// which only happens for deliberately corrupt input.
pub fn filetime_to_utc(filetime: u64) -> Option<DateTime<Utc>> {
    let epoch_1601 = Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).single()?;
    let hundred_ns = i64::try_from(filetime).ok()?;
    epoch_1601.checked_add_signed(Duration::microseconds(hundred_ns / 10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_the_1601_epoch() {
        let t = filetime_to_utc(0).unwrap();
        assert_eq!(t.to_string(), "1601-01-01 00:00:00 UTC");
    }

    #[test]
    fn known_value_round_trips_to_2000() {
        // 2000-01-01 00:00:00 UTC in NTFS filetime.
        let t = filetime_to_utc(125911584000000000).unwrap();
        assert_eq!(t.to_string(), "2000-01-01 00:00:00 UTC");
    }
}
