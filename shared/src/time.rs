//! Timestamp helpers. Server timestamps are opaque strings; these turn them
//! into comparable epoch values and display labels.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

const ACTIVITY_LABEL_FORMAT: &str = "%b %-d, %Y";

/// Parses RFC 3339, naive ISO date-times (UTC) or bare `YYYY-MM-DD` dates.
#[must_use]
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp_millis());
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// `Mar 4, 2024` style label, or `None` for unparseable input.
#[must_use]
pub fn format_activity_label(value: &str) -> Option<String> {
    let millis = parse_timestamp_ms(value)?;
    let dt = DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some(dt.format(ACTIVITY_LABEL_FORMAT).to_string())
}

/// Returns the raw string of the latest parseable date, or an empty string.
pub fn latest_date<'a>(dates: impl IntoIterator<Item = &'a str>) -> String {
    dates
        .into_iter()
        .filter_map(|raw| parse_timestamp_ms(raw).map(|ms| (ms, raw)))
        .max_by_key(|(ms, _)| *ms)
        .map(|(_, raw)| raw.trim().to_string())
        .unwrap_or_default()
}

/// Current UTC time as RFC 3339. Only used where the server omitted a
/// timestamp, so the value is approximate.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
