use chrono::{DateTime, Utc};

/// Length of one 15-minute market round in seconds.
pub const ROUND_SECONDS: i64 = 900;

/// Unix timestamp of the current round's start (floored to 900 s buckets).
pub fn current_round_ts(now: DateTime<Utc>) -> i64 {
    now.timestamp() / ROUND_SECONDS * ROUND_SECONDS
}

/// Seconds until `resolution_time`, negative once the market has closed.
pub fn seconds_to_close(resolution_time: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (resolution_time - now).num_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_bucket_floors_to_quarter_hour() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 18, 52, 30).unwrap();
        let start = current_round_ts(ts);
        assert_eq!(start % ROUND_SECONDS, 0);
        let start_dt = Utc.timestamp_opt(start, 0).unwrap();
        assert_eq!(start_dt.format("%H:%M").to_string(), "18:45");
    }

    #[test]
    fn seconds_to_close_goes_negative_after_resolution() {
        let res = Utc.with_ymd_and_hms(2026, 1, 10, 18, 45, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 1, 10, 18, 43, 30).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 10, 18, 45, 12).unwrap();
        assert_eq!(seconds_to_close(res, before), 90);
        assert_eq!(seconds_to_close(res, after), -12);
    }
}
