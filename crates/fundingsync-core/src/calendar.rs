//! Calendar helpers: month buckets, day boundaries and the injectable clock.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const SECS_PER_DAY: i64 = 86_400;

// ─── Clock ────────────────────────────────────────────────────────────────────

/// Source of "now". Injected so staleness and windows are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Build from epoch seconds; out-of-range values fall back to the epoch.
    pub fn at_timestamp(ts: i64) -> Self {
        Self::new(DateTime::from_timestamp(ts, 0).unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ─── Day helpers ──────────────────────────────────────────────────────────────

/// UTC calendar date of an epoch-seconds timestamp.
pub fn date_of(ts: i64) -> NaiveDate {
    DateTime::from_timestamp(ts, 0)
        .unwrap_or_default()
        .date_naive()
}

/// Epoch seconds of 00:00:00 UTC on `date`.
pub fn day_start_ts(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Whole days elapsed between `ts` and `now_ts`, clamped at zero.
pub fn days_between(ts: i64, now_ts: i64) -> u32 {
    let days = (now_ts - ts).max(0) / SECS_PER_DAY;
    u32::try_from(days).unwrap_or(u32::MAX)
}

// ─── YearMonth ────────────────────────────────────────────────────────────────

/// A calendar month, the unit of cache granularity.
///
/// Stored as the first day of the month so it is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    /// Month containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self(date - Duration::days(i64::from(date.day0())))
    }

    /// Month containing the epoch-seconds timestamp `ts`.
    pub fn of_timestamp(ts: i64) -> Self {
        Self::containing(date_of(ts))
    }

    /// Returns `None` when `month` is not in `1..=12`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// Last calendar day of the month.
    pub fn last_day(&self) -> NaiveDate {
        self.next().0 - Duration::days(1)
    }

    pub fn prev(&self) -> Self {
        Self::containing(self.0 - Duration::days(1))
    }

    pub fn next(&self) -> Self {
        Self::containing(self.0 + Duration::days(32))
    }

    /// Epoch seconds of the month's first instant.
    pub fn start_ts(&self) -> i64 {
        day_start_ts(self.0)
    }

    /// Epoch seconds of the first instant of the following month.
    pub fn end_ts(&self) -> i64 {
        self.next().start_ts()
    }

    pub fn contains_ts(&self, ts: i64) -> bool {
        ts >= self.start_ts() && ts < self.end_ts()
    }

    /// Months spanning `[from, to]`, newest first. Empty when `from > to`.
    pub fn spanning(from: NaiveDate, to: NaiveDate) -> Vec<YearMonth> {
        if from > to {
            return vec![];
        }
        let first = Self::containing(from);
        let mut current = Self::containing(to);
        let mut months = vec![current];
        while current > first {
            current = current.prev();
            months.push(current);
        }
        months
    }

    /// The `count` months ending with the one containing `today`, newest first.
    pub fn trailing(today: NaiveDate, count: u32) -> Vec<YearMonth> {
        let mut months = Vec::with_capacity(count as usize);
        let mut current = Self::containing(today);
        for _ in 0..count {
            months.push(current);
            current = current.prev();
        }
        months
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for YearMonth {
    type Err = String;

    /// Parses `"YYYY-MM"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s:?}"))?;
        let year: i32 = y.parse().map_err(|_| format!("bad year in {s:?}"))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in {s:?}"))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn containing_and_neighbours() {
        let ym = YearMonth::containing(d(2024, 3, 17));
        assert_eq!(ym.to_string(), "2024-03");
        assert_eq!(ym.prev().to_string(), "2024-02");
        assert_eq!(ym.next().to_string(), "2024-04");
        assert_eq!(YearMonth::new(2024, 1).unwrap().prev().to_string(), "2023-12");
        assert_eq!(YearMonth::new(2024, 12).unwrap().next().to_string(), "2025-01");
        assert_eq!(ym.last_day(), d(2024, 3, 31));
        assert_eq!(ym.prev().last_day(), d(2024, 2, 29)); // leap year
    }

    #[test]
    fn spanning_is_newest_first() {
        let months = YearMonth::spanning(d(2024, 1, 20), d(2024, 4, 2));
        let names: Vec<_> = months.iter().map(|m| m.to_string()).collect();
        assert_eq!(names, vec!["2024-04", "2024-03", "2024-02", "2024-01"]);
        assert!(YearMonth::spanning(d(2024, 5, 1), d(2024, 4, 1)).is_empty());
    }

    #[test]
    fn trailing_months() {
        let months = YearMonth::trailing(d(2024, 2, 10), 12);
        assert_eq!(months.len(), 12);
        assert_eq!(months[0].to_string(), "2024-02");
        assert_eq!(months[11].to_string(), "2023-03");
    }

    #[test]
    fn timestamps_round_trip_through_months() {
        let ym = YearMonth::new(2024, 2).unwrap();
        assert!(ym.contains_ts(ym.start_ts()));
        assert!(!ym.contains_ts(ym.end_ts()));
        assert_eq!(YearMonth::of_timestamp(ym.end_ts() - 1), ym);
        assert_eq!(date_of(day_start_ts(d(2024, 2, 29))), d(2024, 2, 29));
    }

    #[test]
    fn parse_year_month() {
        assert_eq!("2023-07".parse::<YearMonth>().unwrap().month(), 7);
        assert!("2023-13".parse::<YearMonth>().is_err());
        assert!("garbage".parse::<YearMonth>().is_err());
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at_timestamp(1_000);
        clock.advance(Duration::seconds(60));
        assert_eq!(clock.now().timestamp(), 1_060);
        assert_eq!(days_between(0, 3 * SECS_PER_DAY + 5), 3);
        assert_eq!(days_between(10, 0), 0);
    }
}
