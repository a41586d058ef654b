//! Time windows
//!
//! Request lines carry naive UTC timestamps. On the wire they are written as
//! comma-separated fields `Y,M,D,h,m,s`.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Error, Result};

/// Naive UTC timestamp
pub type Timestamp = NaiveDateTime;

/// Stand-in for an open end when a line has to be written out
pub fn open_end() -> Timestamp {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Parse `Y,M,D[,h[,m[,s[,us]]]]`
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let fields = s
        .split(',')
        .map(|f| f.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::syntax())?;

    if fields.len() < 3 || fields.len() > 7 {
        return Err(Error::syntax());
    }

    let field = |i: usize| fields.get(i).copied().unwrap_or(0);

    NaiveDate::from_ymd_opt(field(0) as i32, field(1), field(2))
        .and_then(|d| d.and_hms_micro_opt(field(3), field(4), field(5), field(6)))
        .ok_or_else(Error::syntax)
}

/// Format as `Y,M,D,h,m,s`
pub fn format_timestamp(t: &Timestamp) -> String {
    format!(
        "{},{},{},{},{},{}",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Whether two windows intersect; `None` as end means open.
/// Touching windows count as overlapping.
pub fn overlaps(
    a_start: &Timestamp,
    a_end: Option<&Timestamp>,
    b_start: &Timestamp,
    b_end: Option<&Timestamp>,
) -> bool {
    let ends_before = |end: Option<&Timestamp>, start: &Timestamp| match end {
        Some(end) => end < start,
        None => false,
    };

    !ends_before(a_end, b_start) && !ends_before(b_end, a_start)
}

/// Whole seconds between two timestamps, never negative
pub fn whole_seconds(start: &Timestamp, end: &Timestamp) -> u64 {
    (*end - *start).num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_parse_and_format() {
        let t = ts("2023,1,1,0,1,0");
        assert_eq!(format_timestamp(&t), "2023,1,1,0,1,0");

        let short = ts("2023,2,3");
        assert_eq!(format_timestamp(&short), "2023,2,3,0,0,0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("2023,1").is_err());
        assert!(parse_timestamp("2023,13,1").is_err());
        assert!(parse_timestamp("2023,x,1").is_err());
        assert!(parse_timestamp("2023,1,1,0,0,0,0,0").is_err());
    }

    #[test]
    fn test_overlaps() {
        let a = ts("2020,1,1");
        let b = ts("2021,1,1");
        let c = ts("2022,1,1");

        assert!(overlaps(&a, Some(&b), &b, Some(&c)));
        assert!(!overlaps(&a, Some(&b), &c, None));
        assert!(overlaps(&a, None, &c, None));
        assert!(overlaps(&b, Some(&c), &a, None));
        assert!(!overlaps(&c, None, &a, Some(&b)));
    }

    #[test]
    fn test_whole_seconds() {
        assert_eq!(whole_seconds(&ts("2023,1,1,0,0,0"), &ts("2023,1,1,0,1,0")), 60);
        assert_eq!(whole_seconds(&ts("2023,1,1,0,1,0"), &ts("2023,1,1,0,0,0")), 0);
    }
}
