//! Lenient `Date:` header parsing
//!
//! Mail clients emit every flavour of RFC 822/1123/3339 timestamps, with or
//! without weekday, seconds, leading zeros or a numeric zone. A date that
//! cannot be understood falls back to the current time and never fails the
//! parse.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

/// Formats carrying a numeric `+hhmm` zone
const ZONED_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S %z",
    "%a, %d %b %Y %H:%M %z",
    "%d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M %z",
    "%d %b %y %H:%M:%S %z",
    "%d %b %y %H:%M %z",
];

/// Formats without any zone, read as UTC
const NAIVE_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S",
    "%a, %d %b %Y %H:%M",
    "%d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M",
    "%d %b %y %H:%M:%S",
    "%d %b %y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const ZONE_SUFFIXES: &[&str] = &[" (GMT)", " (UTC)", " GMT", " UTC"];

/// Parse a Date header value, defaulting to now
pub fn parse_email_date(value: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Utc::now();
    };

    if let Some(date) = try_parse(raw) {
        return date;
    }

    let mut cleaned = raw;
    for suffix in ZONE_SUFFIXES {
        cleaned = cleaned.strip_suffix(suffix).unwrap_or(cleaned);
    }
    if let Some(date) = try_parse(cleaned.trim()) {
        return date;
    }

    debug!("Failed to parse email date: {}, using current time", raw);
    Utc::now()
}

/// Try every accepted format on a single candidate string
pub fn try_parse(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }

    for format in ZONED_FORMATS {
        if let Ok(date) = DateTime::parse_from_str(value, format) {
            return Some(date.with_timezone(&Utc));
        }
    }

    // Trailing alphabetic zone name, e.g. "PST" or "CEST"
    if let Some((rest, zone)) = value.rsplit_once(' ') {
        if !zone.is_empty() && zone.chars().all(|c| c.is_ascii_alphabetic()) {
            if let Some(naive) = parse_naive(rest.trim()) {
                let offset = zone_offset(zone)?;
                return offset
                    .from_local_datetime(&naive)
                    .single()
                    .map(|d| d.with_timezone(&Utc));
            }
        }
    }

    parse_naive(value).map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Offset for a zone abbreviation; unknown names are read as UTC
fn zone_offset(zone: &str) -> Option<FixedOffset> {
    let hours = match zone.to_ascii_uppercase().as_str() {
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        "CET" => 1,
        "CEST" => 2,
        _ => 0,
    };
    FixedOffset::east_opt(hours * 3600)
}
