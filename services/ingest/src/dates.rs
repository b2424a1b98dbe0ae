//! Timestamp normalization for source payloads.
//!
//! The payment platform returns timestamps in several shapes, sometimes within
//! a single collection. [`normalize`] tries an ordered list of rules and gives
//! up with `None` rather than guessing:
//!
//! 1. RFC 3339 / ISO-8601 with an offset, returned as the same instant in UTC
//! 2. `D/M, H:MM` with the year taken from `reference_year`
//! 3. `D MonthName H:MM AM|PM` with the year taken from `reference_year`
//! 4. bare `YYYY-MM-DD`, expanded to midnight UTC
//! 5. generic fallbacks: offset-less date-times (read as UTC), RFC 2822, Unix epoch seconds or milliseconds
//!
//! Results before 2000 or more than [`MAX_YEARS_AHEAD`] years after the
//! reference year are rejected.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

pub const MIN_YEAR: i32 = 2000;
pub const MAX_YEARS_AHEAD: i32 = 5;

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

static DAY_MONTH_SHORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2})/(\d{1,2}),?\s*(\d{1,2}):(\d{2})$").expect("valid regex")
});

static DAY_MONTH_NAME_12H: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2})\s+([A-Za-z]+)\.?,?\s+(\d{1,2}):(\d{2})\s*([AaPp][Mm])$")
        .expect("valid regex")
});

static BARE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"));

static EPOCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{10}(\d{3})?$").expect("valid regex"));

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Normalize a raw source timestamp into a UTC instant.
///
/// Pure and deterministic for a given `(raw, reference_year)`. Never panics.
pub fn normalize(raw: Option<&str>, reference_year: i32) -> Option<DateTime<Utc>> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }

    let parsed = parse_iso_with_offset(s)
        .or_else(|| parse_day_month_short(s, reference_year))
        .or_else(|| parse_day_month_name_12h(s, reference_year))
        .or_else(|| parse_bare_date(s))
        .or_else(|| parse_generic(s))?;

    in_bounds(parsed, reference_year).then_some(parsed)
}

/// [`normalize`] against the current calendar year.
pub fn normalize_now(raw: Option<&str>) -> Option<DateTime<Utc>> {
    normalize(raw, Utc::now().year())
}

fn in_bounds(dt: DateTime<Utc>, reference_year: i32) -> bool {
    let year = dt.year();
    year >= MIN_YEAR && year <= reference_year.saturating_add(MAX_YEARS_AHEAD)
}

fn parse_iso_with_offset(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_day_month_short(s: &str, year: i32) -> Option<DateTime<Utc>> {
    let caps = DAY_MONTH_SHORT.captures(s)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let hour: u32 = caps[3].parse().ok()?;
    let minute: u32 = caps[4].parse().ok()?;
    utc(year, month, day, hour, minute)
}

fn parse_day_month_name_12h(s: &str, year: i32) -> Option<DateTime<Utc>> {
    let caps = DAY_MONTH_NAME_12H.captures(s)?;
    let day: u32 = caps[1].parse().ok()?;
    let month = month_number(&caps[2])?;
    let hour12: u32 = caps[3].parse().ok()?;
    let minute: u32 = caps[4].parse().ok()?;
    if !(1..=12).contains(&hour12) {
        return None;
    }
    let pm = caps[5].eq_ignore_ascii_case("pm");
    let hour = match (hour12, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    utc(year, month, day, hour, minute)
}

fn parse_bare_date(s: &str) -> Option<DateTime<Utc>> {
    if !BARE_DATE.is_match(s) {
        return None;
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn parse_generic(s: &str) -> Option<DateTime<Utc>> {
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if EPOCH.is_match(s) {
        let n: i64 = s.parse().ok()?;
        return if s.len() == 13 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
    }
    None
}

/// Month number from a full English name or its three-letter prefix.
fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| *m == lower || (lower.len() == 3 && m.starts_with(&lower)))
        .map(|i| i as u32 + 1)
}

fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}
