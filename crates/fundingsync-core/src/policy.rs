//! Cache policy — decides whether cached data can be served without a network call.

use serde::{Deserialize, Serialize};

use crate::store::{DayIndex, MonthBucket};

/// Freshness windows. Past months are immutable; only the current month and
/// the day index age out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// How long an open (current-month) bucket may be served before re-fetching.
    pub open_month_ttl_secs: i64,
    /// How long the day index may vouch for "today is covered".
    pub index_ttl_secs: i64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            open_month_ttl_secs: 300,
            index_ttl_secs: 300,
        }
    }
}

impl CachePolicy {
    /// Returns `true` if `bucket` must be re-fetched before serving.
    ///
    /// - closed bucket (fetched after its month ended): never stale
    /// - open bucket whose month has since ended: always stale
    /// - open bucket for the current month: stale once older than the TTL
    pub fn is_stale(&self, bucket: &MonthBucket, is_current_month: bool, now_ts: i64) -> bool {
        if bucket.closed {
            return false;
        }
        if !is_current_month {
            return true;
        }
        now_ts - bucket.fetched_at > self.open_month_ttl_secs
    }

    /// A bucket satisfies its month when it holds the whole month and is fresh.
    pub fn satisfies(&self, bucket: &MonthBucket, is_current_month: bool, now_ts: i64) -> bool {
        bucket.complete && !self.is_stale(bucket, is_current_month, now_ts)
    }

    pub fn is_index_fresh(&self, index: &DayIndex, now_ts: i64) -> bool {
        now_ts - index.updated_at <= self.index_ttl_secs
    }
}
