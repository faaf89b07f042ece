//! Lenient date parsing with day-before-month preference.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

const YEAR_FIRST_DATETIMES: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const TIMES: &[&str] = &["%H:%M:%S", "%H:%M:%S%.f", "%H:%M", "%I:%M:%S %p", "%I:%M %p"];

const NAMED_MONTH_DATES: &[&str] = &[
    "%d %B %Y",
    "%d %b %Y",
    "%d-%b-%Y",
    "%d %b, %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%b %d %Y",
];

/// Parse `input` and truncate it to midnight.
///
/// Numeric forms with a leading four-digit year are read year-month-day.
/// Other numeric forms are read day-month-year, falling back to
/// month-day-year only when the day-first reading is not a real date.
pub fn parse_day_first(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    parse_date(input).map(|date| date.and_time(NaiveTime::MIN))
}

fn parse_date(input: &str) -> Option<NaiveDate> {
    if let Ok(stamp) = DateTime::parse_from_rfc3339(input) {
        return Some(stamp.naive_local().date());
    }
    for format in YEAR_FIRST_DATETIMES {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(input, format) {
            return Some(stamp.date());
        }
    }
    if let Some(date) = parse_numeric(input) {
        return Some(date);
    }
    NAMED_MONTH_DATES
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
}

fn parse_numeric(input: &str) -> Option<NaiveDate> {
    let (date_part, time_part) = match input.split_once([' ', 'T']) {
        Some((date, time)) => (date, time.trim()),
        None => (input, ""),
    };
    if !time_part.is_empty() && !TIMES.iter().any(|f| NaiveTime::parse_from_str(time_part, f).is_ok()) {
        return None;
    }

    let separator = date_part.chars().find(|c| matches!(c, '/' | '-' | '.'))?;
    let parts: Vec<&str> = date_part.split(separator).collect();
    let [a, b, c] = parts.as_slice() else {
        return None;
    };
    if ![a, b, c].iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }

    if a.len() == 4 {
        return ymd(a.parse().ok()?, b.parse().ok()?, c.parse().ok()?);
    }
    if a.len() > 2 || b.len() > 2 {
        return None;
    }
    let year = expand_year(c)?;
    let first: u32 = a.parse().ok()?;
    let second: u32 = b.parse().ok()?;
    ymd(year, second, first).or_else(|| ymd(year, first, second))
}

fn expand_year(text: &str) -> Option<i32> {
    let value: i32 = text.parse().ok()?;
    match text.len() {
        4 => Some(value),
        2 if value < 70 => Some(2000 + value),
        2 => Some(1900 + value),
        _ => None,
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}
