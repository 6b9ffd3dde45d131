use chrono::{Local, TimeZone, Utc};

/// Session date key format.
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Current time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Session key of the local calendar day.
pub fn today_key() -> String {
    Local::now().format(DATE_KEY_FORMAT).to_string()
}

/// Local calendar day of a millisecond timestamp, or None if out of range.
pub fn date_key(ts_millis: i64) -> Option<String> {
    match Local.timestamp_millis_opt(ts_millis) {
        chrono::LocalResult::Single(datetime) => Some(datetime.format(DATE_KEY_FORMAT).to_string()),
        chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest.format(DATE_KEY_FORMAT).to_string()),
        chrono::LocalResult::None => None,
    }
}

/// Whether `key` looks like a session date key.
pub fn is_date_key(key: &str) -> bool {
    chrono::NaiveDate::parse_from_str(key, DATE_KEY_FORMAT).is_ok() && key.len() == 10
}

/// Format a millisecond timestamp as UTC string, or return a placeholder on error.
pub fn format_timestamp(ts_millis: i64) -> String {
    match Utc.timestamp_millis_opt(ts_millis) {
        chrono::LocalResult::Single(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "invalid timestamp".to_string(),
    }
}

/// Format an optional millisecond timestamp, using '-' when missing or zero.
pub fn format_timestamp_opt(ts: Option<i64>) -> String {
    ts.filter(|ts| *ts > 0)
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000_000), "2023-11-14 22:13:20");
        assert_eq!(format_timestamp(i64::MAX), "invalid timestamp");
        assert_eq!(format_timestamp_opt(None), "-");
        assert_eq!(format_timestamp_opt(Some(0)), "-");
    }

    #[test]
    fn test_date_keys() {
        assert!(is_date_key(&today_key()));
        assert!(is_date_key("2025-03-15"));
        assert!(!is_date_key("2025-3-15"));
        assert!(!is_date_key("today"));
        assert_eq!(date_key(now_millis()), Some(today_key()));
        assert_eq!(date_key(i64::MAX), None);
    }
}
