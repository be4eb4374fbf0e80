/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cmp::Ordering;
use std::sync::Mutex;

use chrono::format::Numeric::*;
use chrono::format::{parse, Fixed, Item, Pad, Parsed};
use chrono::{DateTime, Duration, DurationRound, ParseResult, TimeZone, Timelike, Utc};

/// Timestamp format used by MDTM/MFMT and MLSD facts (RFC 3659),
/// `YYYYMMDDHHMMSS` with an optional fractional part.
pub const RFC3659: &[Item<'static>] = &[
    Item::Numeric(Year, Pad::Zero),
    Item::Numeric(Month, Pad::Zero),
    Item::Numeric(Day, Pad::Zero),
    Item::Numeric(Hour, Pad::Zero),
    Item::Numeric(Minute, Pad::Zero),
    Item::Numeric(Second, Pad::Zero),
    Item::Fixed(Fixed::Nanosecond),
];

#[inline]
pub(crate) fn parse_rfc3659(s: &str) -> ParseResult<DateTime<Utc>> {
    let mut parsed = Parsed::new();
    parse(&mut parsed, s, RFC3659.iter())?;
    parsed.to_datetime_with_timezone(&Utc)
}

/// The finest meaningful unit of a remote timestamp. Listings often carry
/// only a date or date+minutes; MDTM carries seconds or milliseconds.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum TimeAccuracy {
    Days,
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
}

impl TimeAccuracy {
    fn truncate(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeAccuracy::Days => dt.duration_trunc(Duration::days(1)).unwrap_or(dt),
            TimeAccuracy::Hours => dt.duration_trunc(Duration::hours(1)).unwrap_or(dt),
            TimeAccuracy::Minutes => dt.duration_trunc(Duration::minutes(1)).unwrap_or(dt),
            TimeAccuracy::Seconds => dt.duration_trunc(Duration::seconds(1)).unwrap_or(dt),
            TimeAccuracy::Milliseconds => dt,
        }
    }
}

/// A wall-clock timestamp tagged with the accuracy of its source.
///
/// Ordering truncates both operands to the coarser accuracy first, so a
/// date-only listing entry and a full MDTM reply for the same day compare
/// equal instead of flapping. Plain equality requires identical accuracy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerDateTime {
    dt: DateTime<Utc>,
    accuracy: TimeAccuracy,
}

impl ServerDateTime {
    pub fn new(dt: DateTime<Utc>, accuracy: TimeAccuracy) -> Self {
        ServerDateTime { dt, accuracy }
    }

    /// Parse a `YYYYMMDDHHMMSS[.fff]` timestamp as found after `213 ` in an
    /// MDTM reply. The value is UTC per RFC 3659.
    pub fn parse_mdtm(s: &str) -> Option<Self> {
        let dt = parse_rfc3659(s.trim()).ok()?;
        let accuracy = if dt.nanosecond() != 0 {
            TimeAccuracy::Milliseconds
        } else {
            TimeAccuracy::Seconds
        };
        Some(ServerDateTime { dt, accuracy })
    }

    /// Format for an MFMT argument, always whole seconds in UTC.
    pub fn format_mfmt(&self) -> String {
        self.dt.format("%Y%m%d%H%M%S").to_string()
    }

    #[inline]
    pub fn datetime(&self) -> DateTime<Utc> {
        self.dt
    }

    #[inline]
    pub fn accuracy(&self) -> TimeAccuracy {
        self.accuracy
    }

    /// Whether the timestamp carries a time of day, not just a date.
    #[inline]
    pub fn has_time(&self) -> bool {
        self.accuracy > TimeAccuracy::Days
    }

    #[must_use]
    pub fn add_minutes(&self, minutes: i64) -> Self {
        ServerDateTime {
            dt: self.dt + Duration::minutes(minutes),
            accuracy: self.accuracy,
        }
    }

    /// Accuracy-aware comparison: both operands truncated to the coarser
    /// accuracy before ordering.
    pub fn compare(&self, other: &Self) -> Ordering {
        let acc = self.accuracy.min(other.accuracy);
        acc.truncate(self.dt).cmp(&acc.truncate(other.dt))
    }
}

/// Wall-clock stamp with a tie-breaking offset.
///
/// The system clock may return the same value on consecutive calls, which
/// breaks strict ordering of cache entries; the offset disambiguates.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MonotonicDateTime {
    time_ms: i64,
    offset: u32,
}

static LAST_STAMP: Mutex<(i64, u32)> = Mutex::new((0, 0));

impl MonotonicDateTime {
    pub fn now() -> Self {
        let now_ms = Utc::now().timestamp_millis();
        let mut last = LAST_STAMP.lock().unwrap();
        if now_ms <= last.0 {
            last.1 += 1;
            MonotonicDateTime {
                time_ms: last.0,
                offset: last.1,
            }
        } else {
            *last = (now_ms, 0);
            MonotonicDateTime {
                time_ms: now_ms,
                offset: 0,
            }
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_ms).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mdtm_seconds() {
        let t = ServerDateTime::parse_mdtm("20200101120000").unwrap();
        assert_eq!(t.accuracy(), TimeAccuracy::Seconds);
        assert_eq!(t.format_mfmt(), "20200101120000");
        assert!(t.has_time());
    }

    #[test]
    fn parse_mdtm_millis() {
        let t = ServerDateTime::parse_mdtm("20211201102030.123").unwrap();
        assert_eq!(t.accuracy(), TimeAccuracy::Milliseconds);
        assert_eq!(t.format_mfmt(), "20211201102030");
    }

    #[test]
    fn parse_mdtm_invalid() {
        assert!(ServerDateTime::parse_mdtm("not a time").is_none());
        assert!(ServerDateTime::parse_mdtm("2020").is_none());
    }

    #[test]
    fn accuracy_aware_compare() {
        let fine = ServerDateTime::parse_mdtm("20200101120030").unwrap();
        let coarse = ServerDateTime::new(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            TimeAccuracy::Days,
        );
        // Same day: equal at the coarser accuracy, unequal by plain eq.
        assert_eq!(fine.compare(&coarse), Ordering::Equal);
        assert_ne!(fine, coarse);

        let next_day = ServerDateTime::new(
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap(),
            TimeAccuracy::Days,
        );
        assert_eq!(fine.compare(&next_day), Ordering::Less);
    }

    #[test]
    fn timezone_adjust() {
        let t = ServerDateTime::parse_mdtm("20200101120000").unwrap();
        let adjusted = t.add_minutes(90);
        assert_eq!(adjusted.format_mfmt(), "20200101133000");
    }

    #[test]
    fn monotonic_stamps_strictly_increase() {
        let mut prev = MonotonicDateTime::now();
        for _ in 0..100 {
            let next = MonotonicDateTime::now();
            assert!(next > prev);
            prev = next;
        }
    }
}
