// crates/core/src/interval.rs
//! Calendar bucketing.
//!
//! All truncation happens on the *local* wall clock of the timezone the
//! input carries (the configured charts timezone), then the local result
//! is resolved back to an instant. Day-and-larger buckets therefore stay
//! aligned to local midnight across DST transitions, and hour buckets
//! advance by true hours so a fall-back day really has 25 of them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Width of a chart bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hours,
    Days,
    Weeks,
    Months,
    Quarters,
    Years,
}

impl Interval {
    /// All intervals, smallest first. Order matters for chart controls.
    pub const ALL: [Interval; 6] = [
        Interval::Hours,
        Interval::Days,
        Interval::Weeks,
        Interval::Months,
        Interval::Quarters,
        Interval::Years,
    ];

    /// The lowercase plural name stored in chart configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Hours => "hours",
            Interval::Days => "days",
            Interval::Weeks => "weeks",
            Interval::Months => "months",
            Interval::Quarters => "quarters",
            Interval::Years => "years",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hours" | "hour" => Ok(Interval::Hours),
            "days" | "day" => Ok(Interval::Days),
            "weeks" | "week" => Ok(Interval::Weeks),
            "months" | "month" => Ok(Interval::Months),
            "quarters" | "quarter" => Ok(Interval::Quarters),
            "years" | "year" => Ok(Interval::Years),
            other => Err(CoreError::UnknownInterval {
                name: other.to_string(),
            }),
        }
    }
}

/// Resolve a local wall-clock time to an instant in `tz`.
///
/// Ambiguous times (fall-back) take the first occurrence. Times inside a
/// DST gap resolve to the moment the clocks resume.
fn from_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(first, _second) => first,
        LocalResult::None => {
            let mut probe = naive;
            loop {
                probe += Duration::minutes(30);
                if let LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&probe)
                {
                    break dt;
                }
            }
        }
    }
}

/// Truncate a local wall-clock time down to its bucket start.
fn truncate_naive(naive: NaiveDateTime, interval: Interval) -> NaiveDateTime {
    let date = naive.date();
    match interval {
        Interval::Hours => naive
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(naive),
        Interval::Days => date.and_hms_opt(0, 0, 0).unwrap_or(naive),
        Interval::Weeks => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            monday.and_hms_opt(0, 0, 0).unwrap_or(naive)
        }
        Interval::Months => date
            .with_day(1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(naive),
        Interval::Quarters => {
            // Quarter starts are months 1/4/7/10.
            let quarter_month = 3 * ((date.month() - 1) / 3) + 1;
            date.with_day(1)
                .and_then(|d| d.with_month(quarter_month))
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or(naive)
        }
        Interval::Years => date
            .with_day(1)
            .and_then(|d| d.with_month(1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(naive),
    }
}

/// Advance a bucket-start wall-clock time to the next bucket start.
fn advance_naive(start: NaiveDateTime, interval: Interval) -> NaiveDateTime {
    match interval {
        Interval::Hours => start + Duration::hours(1),
        Interval::Days => start + Duration::days(1),
        Interval::Weeks => start + Duration::days(7),
        Interval::Months => add_months(start, 1),
        Interval::Quarters => add_months(start, 3),
        Interval::Years => add_months(start, 12),
    }
}

/// Month arithmetic on a first-of-month bucket start (day is always 1, so
/// the result is always a valid date).
fn add_months(start: NaiveDateTime, months: u32) -> NaiveDateTime {
    let zero_based = start.year() * 12 + start.month0() as i32 + months as i32;
    let year = zero_based.div_euclid(12);
    let month0 = zero_based.rem_euclid(12) as u32;
    start
        .date()
        .with_year(year)
        .and_then(|d| d.with_month0(month0))
        .map(|d| d.and_time(start.time()))
        .unwrap_or(start)
}

/// Start of the bucket containing `t`, in `t`'s own timezone.
pub fn truncate(t: DateTime<Tz>, interval: Interval) -> DateTime<Tz> {
    from_local(t.timezone(), truncate_naive(t.naive_local(), interval))
}

/// Last representable instant before the next bucket boundary: the start
/// of the following bucket minus one microsecond. Used as an inclusive
/// upper bound for range queries and cache finality checks.
pub fn truncate_ceiling(t: DateTime<Tz>, interval: Interval) -> DateTime<Tz> {
    let next = advance_naive(truncate_naive(t.naive_local(), interval), interval);
    from_local(t.timezone(), next) - Duration::microseconds(1)
}

/// Ordered bucket-start instants from `truncate(since)` through `until`
/// inclusive.
pub fn enumerate_buckets(
    interval: Interval,
    since: DateTime<Tz>,
    until: DateTime<Tz>,
) -> Vec<DateTime<Tz>> {
    let mut buckets = Vec::new();
    if since > until {
        return buckets;
    }
    let tz = since.timezone();
    match interval {
        // Hour buckets advance by true hours so DST fall-back produces a
        // 25-bucket day rather than a skipped local hour.
        Interval::Hours => {
            let mut cur = truncate(since, interval);
            while cur <= until {
                buckets.push(cur);
                cur += Duration::hours(1);
            }
        }
        _ => {
            let mut cur = truncate_naive(since.naive_local(), interval);
            loop {
                let instant = from_local(tz, cur);
                if instant > until {
                    break;
                }
                buckets.push(instant);
                cur = advance_naive(cur, interval);
            }
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono_tz::America::Chicago;
    use chrono_tz::Europe::Prague;
    use chrono_tz::UTC;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        from_local(
            tz,
            NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, 0)
                .unwrap(),
        )
    }

    #[test]
    fn truncate_week_starts_monday() {
        // 2010-10-08 is a Friday; its week starts 2010-10-04.
        let t = at(UTC, 2010, 10, 8, 13, 30);
        assert_eq!(truncate(t, Interval::Weeks), at(UTC, 2010, 10, 4, 0, 0));
    }

    #[test]
    fn truncate_quarter_boundaries() {
        assert_eq!(
            truncate(at(UTC, 2010, 11, 20, 5, 0), Interval::Quarters),
            at(UTC, 2010, 10, 1, 0, 0)
        );
        assert_eq!(
            truncate(at(UTC, 2011, 2, 1, 0, 0), Interval::Quarters),
            at(UTC, 2011, 1, 1, 0, 0)
        );
    }

    #[test]
    fn truncate_ceiling_all_intervals() {
        let t = at(Chicago, 2022, 1, 8, 0, 0);
        let cases = [
            (Interval::Hours, (2022, 1, 8, 0, 59)),
            (Interval::Days, (2022, 1, 8, 23, 59)),
            (Interval::Weeks, (2022, 1, 9, 23, 59)),
            (Interval::Months, (2022, 1, 31, 23, 59)),
            (Interval::Quarters, (2022, 3, 31, 23, 59)),
            (Interval::Years, (2022, 12, 31, 23, 59)),
        ];
        for (interval, (y, mo, d, h, mi)) in cases {
            let expected = at(Chicago, y, mo, d, h, mi)
                + Duration::seconds(59)
                + Duration::microseconds(999_999);
            assert_eq!(truncate_ceiling(t, interval), expected, "{interval}");
        }
    }

    #[test]
    fn enumerate_days_inclusive_bounds() {
        let buckets = enumerate_buckets(
            Interval::Days,
            at(UTC, 2010, 10, 8, 12, 0),
            at(UTC, 2010, 10, 12, 0, 0),
        );
        assert_eq!(
            buckets,
            vec![
                at(UTC, 2010, 10, 8, 0, 0),
                at(UTC, 2010, 10, 9, 0, 0),
                at(UTC, 2010, 10, 10, 0, 0),
                at(UTC, 2010, 10, 11, 0, 0),
                at(UTC, 2010, 10, 12, 0, 0),
            ]
        );
    }

    #[test]
    fn enumerate_quarters_recur_every_three_months() {
        let buckets = enumerate_buckets(
            Interval::Quarters,
            at(UTC, 2010, 10, 8, 0, 0),
            at(UTC, 2011, 10, 8, 0, 0),
        );
        let starts: Vec<(i32, u32)> = buckets.iter().map(|b| (b.year(), b.month())).collect();
        assert_eq!(
            starts,
            vec![(2010, 10), (2011, 1), (2011, 4), (2011, 7), (2011, 10)]
        );
    }

    #[test]
    fn enumerate_days_across_fall_back_keeps_every_day() {
        // Prague leaves DST on 2019-10-27; the day is 25 hours long but
        // still exactly one bucket.
        let buckets = enumerate_buckets(
            Interval::Days,
            at(Prague, 2019, 10, 26, 0, 0),
            at(Prague, 2019, 10, 29, 0, 0),
        );
        let days: Vec<u32> = buckets.iter().map(|b| b.day()).collect();
        assert_eq!(days, vec![26, 27, 28, 29]);
        // The long day spans 25 real hours.
        assert_eq!(buckets[2] - buckets[1], Duration::hours(25));
    }

    #[test]
    fn enumerate_hours_across_fall_back_has_extra_bucket() {
        let buckets = enumerate_buckets(
            Interval::Hours,
            at(Prague, 2019, 10, 27, 0, 0),
            at(Prague, 2019, 10, 27, 4, 0) + Duration::hours(1),
        );
        // 00:00→05:00 local covers six wall-clock labels but the 02:00
        // label occurs twice, giving seven true hour buckets.
        assert_eq!(buckets.len(), 7);
        for pair in buckets.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::hours(1));
        }
    }

    #[test]
    fn empty_when_since_after_until() {
        let buckets = enumerate_buckets(
            Interval::Days,
            at(UTC, 2010, 10, 12, 0, 0),
            at(UTC, 2010, 10, 8, 0, 0),
        );
        assert!(buckets.is_empty());
    }

    #[test]
    fn interval_round_trips_through_str() {
        for interval in Interval::ALL {
            assert_eq!(interval.as_str().parse::<Interval>().unwrap(), interval);
        }
    }

    proptest! {
        #[test]
        fn truncate_brackets_input(secs in 0i64..4_102_444_800, idx in 0usize..6) {
            let interval = Interval::ALL[idx];
            let t = UTC.timestamp_opt(secs, 0).unwrap();
            let lo = truncate(t, interval);
            let hi = truncate_ceiling(t, interval);
            prop_assert!(lo <= t);
            prop_assert!(t <= hi);
            // Ceiling of the bucket start is the same inclusive bound.
            prop_assert_eq!(truncate_ceiling(lo, interval), hi);
        }

        #[test]
        fn enumerate_is_strictly_increasing_and_idempotent(
            start in 0i64..4_102_444_800,
            span in 0i64..400,
            idx in 0usize..6,
        ) {
            let interval = Interval::ALL[idx];
            let since = UTC.timestamp_opt(start, 0).unwrap();
            let until = since + Duration::days(span);
            let buckets = enumerate_buckets(interval, since, until);
            prop_assert!(!buckets.is_empty());
            prop_assert_eq!(buckets[0], truncate(since, interval));
            for pair in buckets.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
            // Restarting from the same bounds reproduces the sequence.
            prop_assert_eq!(enumerate_buckets(interval, since, until), buckets);
        }
    }
}
