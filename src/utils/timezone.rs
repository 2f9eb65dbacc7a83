use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("unrecognised timezone '{0}' (expected e.g. 'utc+3:30' or 'Asia/Tehran')")]
pub struct TimezoneError(pub String);

/// Timezone the output table is expressed in.
///
/// Accepts the short `utc+H[:MM]` notation used by the front end as well as
/// IANA names, which follow daylight saving.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OhlcTimezone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl OhlcTimezone {
    pub fn utc() -> Self {
        OhlcTimezone::Fixed(Utc.fix())
    }

    pub fn parse(input: &str) -> Result<Self, TimezoneError> {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();

        let offset_part = lower
            .strip_prefix("utc")
            .or_else(|| lower.strip_prefix("gmt"))
            .or_else(|| {
                if lower.starts_with('+') || lower.starts_with('-') {
                    Some(lower.as_str())
                } else {
                    None
                }
            });

        if let Some(rest) = offset_part {
            if rest.is_empty() {
                return Ok(Self::utc());
            }
            return parse_offset(rest)
                .map(OhlcTimezone::Fixed)
                .ok_or_else(|| TimezoneError(trimmed.to_string()));
        }

        trimmed
            .parse::<Tz>()
            .map(OhlcTimezone::Named)
            .map_err(|_| TimezoneError(trimmed.to_string()))
    }

    /// Offset in effect at the given instant.
    pub fn offset_at(&self, instant: &DateTime<Utc>) -> FixedOffset {
        match self {
            OhlcTimezone::Fixed(offset) => *offset,
            OhlcTimezone::Named(tz) => tz.offset_from_utc_datetime(&instant.naive_utc()).fix(),
        }
    }

    pub fn to_local(&self, instant: &DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset_at(instant))
    }

    /// Interpret a wall-clock time in this zone. Ambiguous times resolve to the
    /// earliest instant; times skipped by a DST jump fall back to the offset in
    /// effect just before the gap.
    pub fn from_local(&self, naive: &NaiveDateTime) -> DateTime<Utc> {
        match self {
            OhlcTimezone::Fixed(offset) => {
                DateTime::<Utc>::from_naive_utc_and_offset(*naive - *offset, Utc)
            }
            OhlcTimezone::Named(tz) => match tz.from_local_datetime(naive).earliest() {
                Some(dt) => dt.with_timezone(&Utc),
                None => {
                    let as_utc = naive.and_utc();
                    let offset = tz.offset_from_utc_datetime(&as_utc.naive_utc()).fix();
                    DateTime::<Utc>::from_naive_utc_and_offset(*naive - offset, Utc)
                }
            },
        }
    }
}

impl FromStr for OhlcTimezone {
    type Err = TimezoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OhlcTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OhlcTimezone::Fixed(offset) => write!(f, "UTC{}", offset),
            OhlcTimezone::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

// "+3", "+3:30", "-05:30", "+0330"
fn parse_offset(rest: &str) -> Option<FixedOffset> {
    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };

    let (hours, minutes) = if let Some((h, m)) = digits.split_once(':') {
        (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?)
    } else if digits.len() == 4 {
        (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?)
    } else {
        (digits.parse::<i32>().ok()?, 0)
    };

    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_short_offsets() {
        let tz = OhlcTimezone::parse("utc+3:30").unwrap();
        assert_eq!(tz, OhlcTimezone::Fixed(FixedOffset::east_opt(12600).unwrap()));

        let tz = OhlcTimezone::parse("UTC-05:30").unwrap();
        assert_eq!(tz, OhlcTimezone::Fixed(FixedOffset::west_opt(19800).unwrap()));

        assert_eq!(OhlcTimezone::parse("utc").unwrap(), OhlcTimezone::utc());
        assert_eq!(
            OhlcTimezone::parse("+7").unwrap(),
            OhlcTimezone::Fixed(FixedOffset::east_opt(7 * 3600).unwrap())
        );
        assert_eq!(
            OhlcTimezone::parse("utc+0330").unwrap(),
            OhlcTimezone::Fixed(FixedOffset::east_opt(12600).unwrap())
        );
    }

    #[test]
    fn test_parse_iana_name() {
        let tz = OhlcTimezone::parse("Asia/Ho_Chi_Minh").unwrap();
        assert_eq!(tz.to_string(), "Asia/Ho_Chi_Minh");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(OhlcTimezone::parse("utc+25").is_err());
        assert!(OhlcTimezone::parse("utc+3:75").is_err());
        assert!(OhlcTimezone::parse("Mars/Olympus").is_err());
    }

    #[test]
    fn test_local_round_trip() {
        let tz = OhlcTimezone::parse("utc+3:30").unwrap();
        let naive = NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let utc = tz.from_local(&naive);
        assert_eq!(utc.to_rfc3339(), "2025-01-02T06:30:00+00:00");
        assert_eq!(tz.to_local(&utc).naive_local(), naive);
    }
}
