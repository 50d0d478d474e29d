//! Cache-gap resolver — decides from the day index alone what must be fetched.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::policy::CachePolicy;
use crate::store::DayIndex;

/// Which part of a requested window is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Need {
    /// Fully cached and fresh.
    None,
    /// History is covered but today is missing or the index aged out.
    RecentOnly,
    /// Today is covered but the requested depth is not.
    HistoricalOnly,
    /// Nothing usable is cached.
    Both,
}

/// Date range to fetch, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub need: Need,
}

/// First date of a trailing `requested_days` window ending on `today`.
pub fn cutoff_date(today: NaiveDate, requested_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(requested_days))
}

/// Compare the day index against a requested depth.
///
/// For [`Need::Both`] with an existing index the range reaches back to the
/// index's newest date when that is older than the cutoff, so a completed
/// fetch leaves a single contiguous covered range.
pub fn compute_missing_range(
    index: Option<&DayIndex>,
    requested_days: u32,
    today: NaiveDate,
    now_ts: i64,
    policy: &CachePolicy,
) -> MissingRange {
    let cutoff = cutoff_date(today, requested_days);
    let Some(index) = index else {
        return MissingRange {
            start_date: cutoff,
            end_date: today,
            need: Need::Both,
        };
    };

    let recent_ok = index.newest >= today && policy.is_index_fresh(index, now_ts);
    let history_ok = index.exhausted || index.oldest <= cutoff;

    match (recent_ok, history_ok) {
        (true, true) => MissingRange {
            start_date: today,
            end_date: today,
            need: Need::None,
        },
        (false, true) => MissingRange {
            start_date: index.newest.min(today),
            end_date: today,
            need: Need::RecentOnly,
        },
        (true, false) => MissingRange {
            start_date: cutoff,
            end_date: index.oldest,
            need: Need::HistoricalOnly,
        },
        (false, false) => MissingRange {
            start_date: cutoff.min(index.newest),
            end_date: today,
            need: Need::Both,
        },
    }
}
