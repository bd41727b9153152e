use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use jobradar_core::Cursor;

/// Bounds how far back a source is asked to re-cover on each run.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalWindow {
    pub lookback: Duration,
    pub buffer: Duration,
}

impl Default for IncrementalWindow {
    fn default() -> Self {
        Self::from_days(7, 1)
    }
}

impl IncrementalWindow {
    pub fn from_days(lookback_days: i64, buffer_days: i64) -> Self {
        Self {
            lookback: Duration::days(lookback_days.max(0)),
            buffer: Duration::days(buffer_days.max(0)),
        }
    }

    pub fn compute_since(&self, cursor: &Cursor, now: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = now - self.lookback;
        match cursor.last_max_post_date_seen {
            Some(seen) => lookback.max(seen - self.buffer),
            None => lookback,
        }
    }

    /// Monotonic: the high-water mark never moves backwards. Returns whether it moved.
    /// Only call this for postings that were actually written.
    pub fn advance_cursor(&self, cursor: &mut Cursor, post_date: Option<&str>) -> bool {
        let Some(parsed) = post_date.and_then(parse_post_date) else {
            return false;
        };
        match cursor.last_max_post_date_seen {
            Some(current) if current >= parsed => false,
            _ => {
                cursor.last_max_post_date_seen = Some(parsed);
                true
            }
        }
    }
}

/// Accepts RFC 3339, RFC 2822, naive datetimes (taken as UTC), plain dates and
/// unix-second strings.
pub fn parse_post_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    }
    None
}
