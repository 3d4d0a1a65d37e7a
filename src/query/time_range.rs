//! The time-range DSL.
//!
//! - `""` — unbounded
//! - `"last <duration>"` — duration is space-separated `w|d|h|m|s` units
//! - `"before <ms>"` / `"after <ms>"` — absolute endpoint
//! - `"<start> - <end>"` — inclusive absolute range

use crate::model::TimeRange;
use crate::{Error, Result};
use std::time::Duration;

const SECS_PER_UNIT: [(u8, u64); 5] = [
    (b'w', 7 * 24 * 3600),
    (b'd', 24 * 3600),
    (b'h', 3600),
    (b'm', 60),
    (b's', 1),
];

/// Parse a duration like `"2w 3d"` or `"30s"`.
pub fn parse_duration(source: &str) -> Result<Duration> {
    let mut total = Duration::ZERO;

    for part in source.split(' ') {
        let Some((unit_char, number)) = part
            .as_bytes()
            .last()
            .map(|last| (*last, &part[..part.len() - 1]))
        else {
            return Err(Error::bad_request(format!("Not a time suffix: {part}")));
        };
        let Some(secs) = SECS_PER_UNIT
            .iter()
            .find_map(|(unit, secs)| (*unit == unit_char).then_some(*secs))
        else {
            return Err(Error::bad_request(format!("Not a time suffix: {part}")));
        };
        let count: u64 = number
            .parse()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| Error::bad_request(format!("Not a number: {part}")))?;

        total += Duration::from_secs(count * secs);
    }
    Ok(total)
}

fn parse_last(value: &str) -> Result<TimeRange> {
    let delta = parse_duration(value)
        .map_err(|_| Error::bad_request(format!("Invalid last timestamp: {value}")))?;
    let start = chrono::Utc::now().timestamp_millis() - delta.as_millis() as i64;
    Ok(TimeRange { start, end: 0 })
}

fn parse_relative(option: &str, value: &str) -> Result<TimeRange> {
    let ts: i64 = value
        .parse()
        .map_err(|_| Error::bad_request(format!("Not a timestamp: {option} {value}")))?;
    Ok(if option == "before" {
        TimeRange { start: 0, end: ts }
    } else {
        TimeRange { start: ts, end: 0 }
    })
}

fn parse_absolute(source: &str) -> Result<TimeRange> {
    let Some((start_s, end_s)) = source.split_once(" - ") else {
        return Err(Error::bad_request(format!("Incorrect 'time_range': {source}")));
    };
    let start: i64 = start_s
        .trim()
        .parse()
        .map_err(|_| Error::bad_request(format!("Invalid start timestamp: {start_s}")))?;
    let end: i64 = end_s
        .trim()
        .parse()
        .map_err(|_| Error::bad_request(format!("Invalid end timestamp: {end_s}")))?;
    if end < start {
        return Err(Error::bad_request(format!(
            "Start after end timestamp: {source}"
        )));
    }
    Ok(TimeRange { start, end })
}

/// Parse a time-range expression. The empty string is the unbounded range.
pub fn parse(source: &str) -> Result<TimeRange> {
    if source.is_empty() {
        return Ok(TimeRange::default());
    }
    let Some(space) = source.find(' ') else {
        return Err(Error::bad_request(format!("Incorrect 'time_range': {source}")));
    };

    match &source[..space] {
        "last" => parse_last(&source[space + 1..]),
        option @ ("before" | "after") => parse_relative(option, &source[space + 1..]),
        _ => parse_absolute(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_range() {
        assert_eq!(parse("5 - 10").unwrap(), TimeRange::new(5, 10));
        assert_eq!(parse(" 5  -  10 ").unwrap_err().status(), 400);
        assert!(parse("10 - 5").is_err());
        assert!(parse("a - 10").is_err());
    }

    #[test]
    fn relative_range() {
        assert_eq!(parse("after 5").unwrap(), TimeRange::new(5, 0));
        assert_eq!(parse("before 9").unwrap(), TimeRange::new(0, 9));
        assert!(parse("after x").is_err());
    }

    #[test]
    fn empty_is_unbounded() {
        assert_eq!(parse("").unwrap(), TimeRange::default());
    }

    #[test]
    fn missing_space_is_rejected() {
        assert!(parse("yesterday").is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(
            parse_duration("1w 2d 3h 4m 5s").unwrap(),
            Duration::from_secs(7 * 86400 + 2 * 86400 + 3 * 3600 + 4 * 60 + 5)
        );
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn last_range_is_start_only() {
        let before = chrono::Utc::now().timestamp_millis();
        let tr = parse("last 1h").unwrap();
        let after = chrono::Utc::now().timestamp_millis();

        assert_eq!(tr.end, 0);
        assert!(tr.start >= before - 3_600_000 && tr.start <= after - 3_600_000);
    }
}
