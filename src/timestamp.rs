/*!
The [`Timestamp`] type.
*/

use std::{fmt, time::Duration};

/**
A wall-clock point in time, stored as the time elapsed since the Unix epoch.

Timestamps format as RFC3339 in UTC, like `2024-05-21T02:43:14.510938000Z`.
*/
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

/**
The calendar parts of a [`Timestamp`] in UTC.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parts {
    /** The year, like `2024`. */
    pub years: u16,
    /** The month, from `1` to `12`. */
    pub months: u8,
    /** The day of the month, from `1` to `31`. */
    pub days: u8,
    /** The hour, from `0` to `23`. */
    pub hours: u8,
    /** The minute, from `0` to `59`. */
    pub minutes: u8,
    /** The second, from `0` to `59`. */
    pub seconds: u8,
    /** Subsecond nanoseconds. */
    pub nanos: u32,
}

// The latest representable time is the last nanosecond of the year 9999
const MAX: Duration = Duration::new(253_402_300_799, 999_999_999);

impl Timestamp {
    /**
    The Unix epoch, `1970-01-01T00:00:00Z`.
    */
    pub const UNIX_EPOCH: Timestamp = Timestamp(Duration::ZERO);

    /**
    Create a timestamp from the time elapsed since the Unix epoch.

    Returns `None` if the time is later than the end of the year 9999.
    */
    pub fn from_unix(unix_time: Duration) -> Option<Self> {
        if unix_time > MAX {
            None
        } else {
            Some(Timestamp(unix_time))
        }
    }

    /**
    The time elapsed since the Unix epoch.
    */
    pub fn to_unix(&self) -> Duration {
        self.0
    }

    /**
    The time elapsed from `earlier` to this timestamp, or `None` if `earlier` is later.
    */
    pub fn duration_since(self, earlier: Self) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    /**
    Split the timestamp into its calendar parts.
    */
    pub fn to_parts(&self) -> Parts {
        const SECS_PER_DAY: u64 = 86_400;

        let secs = self.0.as_secs();
        let days = secs / SECS_PER_DAY;
        let secs_of_day = secs % SECS_PER_DAY;

        let (years, months, days) = civil_from_days(days as i64);

        Parts {
            years: years as u16,
            months,
            days,
            hours: (secs_of_day / 3600) as u8,
            minutes: ((secs_of_day % 3600) / 60) as u8,
            seconds: (secs_of_day % 60) as u8,
            nanos: self.0.subsec_nanos(),
        }
    }

    /**
    Create a timestamp from its calendar parts.

    Returns `None` if any part is out of range.
    */
    pub fn from_parts(parts: Parts) -> Option<Self> {
        if !(1970..=9999).contains(&parts.years)
            || !(1..=12).contains(&parts.months)
            || !(1..=31).contains(&parts.days)
            || parts.hours > 23
            || parts.minutes > 59
            || parts.seconds > 59
            || parts.nanos > 999_999_999
        {
            return None;
        }

        let days = days_from_civil(parts.years as i64, parts.months, parts.days);
        if days < 0 {
            return None;
        }

        let secs = days as u64 * 86_400
            + parts.hours as u64 * 3600
            + parts.minutes as u64 * 60
            + parts.seconds as u64;

        Timestamp::from_unix(Duration::new(secs, parts.nanos))
    }
}

// Days since the epoch to a proleptic Gregorian date
// See: http://howardhinnant.github.io/date_algorithms.html
fn civil_from_days(days: i64) -> (i64, u8, u8) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };

    (y, m, d)
}

fn days_from_civil(y: i64, m: u8, d: u8) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = m as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;

    era * 146_097 + doe - 719_468
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Parts {
            years,
            months,
            days,
            hours,
            minutes,
            seconds,
            nanos,
        } = self.to_parts();

        write!(
            f,
            "{years:04}-{months:02}-{days:02}T{hours:02}:{minutes:02}:{seconds:02}.{nanos:09}Z"
        )
    }
}

#[cfg(feature = "sval")]
impl sval::Value for Timestamp {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        sval::stream_display(&mut *stream, self)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_as_rfc3339() {
        let ts = Timestamp::from_unix(Duration::new(1_716_259_394, 510_938_000)).unwrap();

        assert_eq!("2024-05-21T02:43:14.510938000Z", ts.to_string());
        assert_eq!(
            "1970-01-01T00:00:00.000000000Z",
            Timestamp::UNIX_EPOCH.to_string()
        );
    }

    #[test]
    fn parts_roundtrip() {
        for secs in [0, 951_782_400, 1_709_208_000, 4_107_542_399, 253_402_300_799] {
            let ts = Timestamp::from_unix(Duration::new(secs, 7)).unwrap();

            assert_eq!(ts, Timestamp::from_parts(ts.to_parts()).unwrap());
        }
    }

    #[test]
    fn leap_days() {
        let parts = Timestamp::from_unix(Duration::from_secs(951_782_400))
            .unwrap()
            .to_parts();

        assert_eq!((2000, 2, 29), (parts.years, parts.months, parts.days));
    }

    #[test]
    fn out_of_range() {
        assert!(Timestamp::from_unix(MAX + Duration::from_nanos(1)).is_none());
        assert!(Timestamp::from_parts(Parts {
            years: 2024,
            months: 13,
            days: 1,
            hours: 0,
            minutes: 0,
            seconds: 0,
            nanos: 0,
        })
        .is_none());
    }
}
