// src/date.rs
use chrono::{DateTime, TimeZone, Utc};

/// How far in the future the Expires header points for cached artifacts.
const EXPIRES_AFTER_SECS: i64 = 7 * 24 * 3600;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Per-worker cache of the Date and Expires header strings, refreshed at
/// most once per second so responses never pay for date formatting.
pub struct DateCache {
    pub date: String,
    pub expires: String,
    last: i64,
}

impl DateCache {
    pub fn new() -> Self {
        let mut dc = Self {
            date: String::new(),
            expires: String::new(),
            last: i64::MIN,
        };
        dc.refresh();
        dc
    }

    pub fn refresh(&mut self) {
        let now = Utc::now().timestamp();
        if now == self.last {
            return;
        }
        self.last = now;
        self.date = format_http_date(now);
        self.expires = format_http_date(now + EXPIRES_AFTER_SECS);
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 1123 date string from epoch seconds.
pub fn format_http_date(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(HTTP_DATE_FORMAT).to_string(),
        None => "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
    }
}

/// Parse an If-Modified-Since style date into epoch seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trips_through_parse() {
        let secs = 784_111_777; // Sun, 06 Nov 1994 08:49:37 GMT
        let formatted = format_http_date(secs);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&formatted), Some(secs));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn test_cache_carries_parseable_date_and_expires() {
        let mut dc = DateCache::new();
        dc.refresh();
        let date = parse_http_date(&dc.date).unwrap();
        let expires = parse_http_date(&dc.expires).unwrap();
        assert_eq!(expires - date, EXPIRES_AFTER_SECS);
    }
}
