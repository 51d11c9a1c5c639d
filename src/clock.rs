use chrono::{DateTime, NaiveDate, Utc};

use crate::model::Ms;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse an instant given as Unix milliseconds, a `YYYY-MM-DD` date (UTC
/// midnight) or an RFC 3339 timestamp.
pub fn parse_instant(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// Render milliseconds as RFC 3339 (UTC), falling back to the raw number.
pub fn format_instant(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
