//! Text encodings of session times used in archive file names.
//!
//! All times have one-second resolution. Both encodings sort lexicographically in
//! chronological order.

use {
    crate::DateTimeUtc,
    chrono::{DateTime, NaiveDateTime},
};

const VERBOSE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const COMPACT_TIME_LEN: usize = 7;
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Drops sub-second precision.
#[must_use]
#[inline]
pub fn whole_seconds(time: DateTimeUtc) -> DateTimeUtc {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

#[must_use]
#[inline]
pub fn format_verbose(time: DateTimeUtc) -> String {
    time.format(VERBOSE_FORMAT).to_string()
}

#[must_use]
#[inline]
pub fn parse_verbose(s: &str) -> Option<DateTimeUtc> {
    let naive = NaiveDateTime::parse_from_str(&s.to_ascii_uppercase(), VERBOSE_FORMAT).ok()?;
    Some(naive.and_utc())
}

#[must_use]
#[inline]
pub fn format_compact(time: DateTimeUtc) -> String {
    let seconds = u64::try_from(time.timestamp()).unwrap_or(0);
    let digits = to_base36(seconds);
    format!("{digits:0>COMPACT_TIME_LEN$}")
}

#[must_use]
#[inline]
pub fn parse_compact(s: &str) -> Option<DateTimeUtc> {
    if s.len() != COMPACT_TIME_LEN {
        return None;
    }
    let seconds = i64::try_from(from_base36(s)?).ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// Width of an encoded compact time.
#[must_use]
#[inline]
pub fn compact_len() -> usize {
    COMPACT_TIME_LEN
}

#[must_use]
#[inline]
pub fn to_base36(mut value: u64) -> String {
    let mut digits = Vec::new();
    loop {
        let digit = usize::try_from(value % 36).unwrap_or(0);
        digits.push(char::from(BASE36_DIGITS.get(digit).copied().unwrap_or(b'0')));
        value /= 36;
        if value == 0 {
            break;
        }
    }
    digits.iter().rev().collect()
}

#[must_use]
#[inline]
pub fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 36).ok()
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn verbose() {
        let time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(format_verbose(time), "20231114T221320Z");
        assert_eq!(parse_verbose("20231114T221320Z"), Some(time));
        assert_eq!(parse_verbose("20231114t221320z"), Some(time));
        assert_eq!(parse_verbose("2023-11-14"), None);
    }

    #[test]
    fn compact() {
        let time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let encoded = format_compact(time);
        assert_eq!(encoded.len(), 7);
        assert_eq!(parse_compact(&encoded), Some(time));
        assert_eq!(format_compact(DateTime::from_timestamp(35, 0).unwrap()), "000000z");
        assert_eq!(parse_compact("zz"), None);
    }

    #[test]
    fn compact_sorts_chronologically() {
        let a = format_compact(DateTime::from_timestamp(1_000, 0).unwrap());
        let b = format_compact(DateTime::from_timestamp(1_600_000_000, 0).unwrap());
        assert!(a < b);
    }

    #[test]
    fn base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("10"), Some(36));
        assert_eq!(from_base36("Z"), Some(35));
        assert_eq!(from_base36(""), None);
        assert_eq!(from_base36("!"), None);
    }
}
