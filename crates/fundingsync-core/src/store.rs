//! Record store — per-wallet monthly buckets and the day index on top of a
//! [`KvStore`].
//!
//! Keys:
//! ```text
//! {namespace}:{wallet prefix}:m:{YYYY-MM}   month bucket
//! {namespace}:{wallet prefix}:idx           day index
//! ```
//!
//! Storage failures never propagate: quota exhaustion triggers eviction and a
//! retry, and anything still failing is logged and skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calendar::{date_of, YearMonth};
use crate::config::SyncConfig;
use crate::dedupe::merge_newest_first;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::FundingRecord;

const MONTH_TAG: &str = ":m:";
const INDEX_TAG: &str = ":idx";

// ─── MonthBucket ──────────────────────────────────────────────────────────────

/// All known records for one wallet and calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthBucket {
    pub wallet: String,
    pub month: YearMonth,
    /// Newest first, deduplicated.
    pub records: Vec<FundingRecord>,
    /// Epoch seconds of the last merge.
    pub fetched_at: i64,
    /// Last merged after the month ended; the bucket is immutable history.
    pub closed: bool,
    /// Holds the entire month rather than the tail reached by a page walk.
    pub complete: bool,
}

impl MonthBucket {
    /// A complete bucket with no records: the month was checked and is empty.
    pub fn is_confirmed_empty(&self) -> bool {
        self.complete && self.records.is_empty()
    }
}

/// How much of a month a write covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Some records of the month (e.g. one page of a walk).
    Partial,
    /// The whole month as of the write.
    Complete,
}

// ─── DayIndex ─────────────────────────────────────────────────────────────────

/// Per-wallet summary of covered dates, used for O(1) gap detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayIndex {
    pub wallet: String,
    /// Most recent fully covered date.
    pub newest: NaiveDate,
    /// Oldest fully covered date.
    pub oldest: NaiveDate,
    /// Epoch seconds of the last update.
    pub updated_at: i64,
    /// Pagination reached the start of the wallet's history.
    #[serde(default)]
    pub exhausted: bool,
}

impl DayIndex {
    pub fn new(wallet: impl Into<String>, oldest: NaiveDate, newest: NaiveDate, now_ts: i64) -> Self {
        Self {
            wallet: wallet.into(),
            newest,
            oldest,
            updated_at: now_ts,
            exhausted: false,
        }
    }

    /// Returns `true` if every date in `[from, to]` is covered.
    pub fn covers(&self, from: NaiveDate, to: NaiveDate) -> bool {
        to <= self.newest && (self.exhausted || from >= self.oldest)
    }

    /// Days of history available, counting both ends.
    pub fn covered_days(&self) -> u32 {
        if self.exhausted {
            return u32::MAX;
        }
        let span = (self.newest - self.oldest).num_days() + 1;
        u32::try_from(span.max(0)).unwrap_or(u32::MAX)
    }

    /// Fold a freshly covered `[oldest, newest]` range into the index.
    ///
    /// Touching or overlapping ranges are unioned. A disjoint range cannot be
    /// represented without dropping days already vouched for, so it is
    /// rejected and the index is left untouched. Returns whether the range
    /// was absorbed.
    pub fn absorb(&mut self, oldest: NaiveDate, newest: NaiveDate, exhausted: bool, now_ts: i64) -> bool {
        let touches = oldest <= self.newest + Duration::days(1) && newest + Duration::days(1) >= self.oldest;
        if !touches {
            return false;
        }
        self.oldest = self.oldest.min(oldest);
        self.newest = self.newest.max(newest);
        self.exhausted |= exhausted;
        self.updated_at = now_ts;
        true
    }
}

// ─── WriteOutcome ─────────────────────────────────────────────────────────────

/// Result of a store write. Failures are absorbed, never returned as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// Stored after removing `evicted` buckets to free space. `evicted_own`
    /// is set when at least one of them belonged to the writing wallet.
    StoredAfterEviction { evicted: usize, evicted_own: bool },
    /// Caching was skipped; the caller still has its data in memory.
    Skipped,
}

impl WriteOutcome {
    pub fn is_stored(&self) -> bool {
        !matches!(self, Self::Skipped)
    }

    /// Stored without losing any of the writing wallet's other buckets.
    ///
    /// Only then may the wallet's day index be advanced afterwards.
    pub fn keeps_coverage(&self) -> bool {
        match self {
            Self::Stored => true,
            Self::StoredAfterEviction { evicted_own, .. } => !evicted_own,
            Self::Skipped => false,
        }
    }
}

// ─── RecordStore ──────────────────────────────────────────────────────────────

/// Funding cache service shared by the fetcher and the loader.
pub struct RecordStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
    key_prefix_len: usize,
    max_evictions: usize,
    /// Logical access tick per key, for least-recently-used eviction.
    access: Mutex<HashMap<String, u64>>,
    tick: AtomicU64,
}

impl RecordStore {
    pub fn new(kv: Arc<dyn KvStore>, config: &SyncConfig) -> Self {
        Self {
            kv,
            namespace: config.namespace.clone(),
            key_prefix_len: config.key_prefix_len,
            max_evictions: config.max_evictions,
            access: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    // ─── Keys ────────────────────────────────────────────────────────────────

    fn wallet_prefix(&self, wallet: &str) -> String {
        let short: String = wallet.chars().take(self.key_prefix_len).collect();
        format!("{}:{short}", self.namespace)
    }

    pub fn month_key(&self, wallet: &str, month: YearMonth) -> String {
        format!("{}{MONTH_TAG}{month}", self.wallet_prefix(wallet))
    }

    pub fn index_key(&self, wallet: &str) -> String {
        format!("{}{INDEX_TAG}", self.wallet_prefix(wallet))
    }

    fn touch(&self, key: &str) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        self.access.lock().unwrap().insert(key.to_string(), tick);
    }

    // ─── Month buckets ───────────────────────────────────────────────────────

    /// Read a month bucket. Undecodable or unreadable entries read as absent.
    pub async fn read_month(&self, wallet: &str, month: YearMonth) -> Option<MonthBucket> {
        let key = self.month_key(wallet, month);
        let raw = match self.kv.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(%key, error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<MonthBucket>(&raw) {
            Ok(bucket) => {
                self.touch(&key);
                Some(bucket)
            }
            Err(e) => {
                warn!(%key, error = %e, "discarding undecodable month bucket");
                None
            }
        }
    }

    /// Merge `records` into the bucket for `month` and persist it.
    pub async fn write_month(
        &self,
        wallet: &str,
        month: YearMonth,
        records: Vec<FundingRecord>,
        coverage: Coverage,
        now_ts: i64,
    ) -> WriteOutcome {
        let mut records = records;
        records.retain(|r| month.contains_ts(r.ts));

        let existing = self.read_month(wallet, month).await;
        // A partial merge into an open bucket may leave a hole between the
        // old fetch and the new records, so only a closed bucket keeps its flag.
        let (previous, kept_complete) = match existing {
            Some(b) => (b.records, b.complete && b.closed),
            None => (vec![], false),
        };
        let bucket = MonthBucket {
            wallet: wallet.to_string(),
            month,
            records: merge_newest_first(previous, records),
            fetched_at: now_ts,
            closed: now_ts >= month.end_ts(),
            complete: kept_complete || coverage == Coverage::Complete,
        };

        let key = self.month_key(wallet, month);
        let value = match serde_json::to_string(&bucket) {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, error = %e, "month bucket not serializable");
                return WriteOutcome::Skipped;
            }
        };
        let outcome = self.put(&key, &value, wallet).await;
        if outcome.is_stored() {
            self.touch(&key);
            debug!(
                %key,
                records = bucket.records.len(),
                complete = bucket.complete,
                closed = bucket.closed,
                "month bucket stored"
            );
        }
        outcome
    }

    /// Records with `ts >= from_ts`, across every month from `from_ts` to `today`.
    pub async fn records_since(&self, wallet: &str, from_ts: i64, today: NaiveDate) -> Vec<FundingRecord> {
        let mut out = Vec::new();
        for month in YearMonth::spanning(date_of(from_ts), today) {
            if let Some(bucket) = self.read_month(wallet, month).await {
                out.extend(bucket.records.into_iter().filter(|r| r.ts >= from_ts));
            }
        }
        merge_newest_first(vec![], out)
    }

    /// Months with a cached bucket for `wallet`, newest first.
    pub async fn cached_months(&self, wallet: &str) -> Vec<YearMonth> {
        let prefix = format!("{}{MONTH_TAG}", self.wallet_prefix(wallet));
        let keys = match self.kv.keys_with_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "cache key scan failed");
                return vec![];
            }
        };
        let mut months: Vec<YearMonth> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.parse().ok())
            .collect();
        months.sort_unstable_by(|a, b| b.cmp(a));
        months
    }

    // ─── Day index ───────────────────────────────────────────────────────────

    pub async fn read_index(&self, wallet: &str) -> Option<DayIndex> {
        let key = self.index_key(wallet);
        let raw = match self.kv.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(%key, error = %e, "day index read failed");
                return None;
            }
        };
        serde_json::from_str(&raw)
            .map_err(|e| warn!(%key, error = %e, "discarding undecodable day index"))
            .ok()
    }

    pub async fn write_index(&self, index: &DayIndex) -> WriteOutcome {
        let key = self.index_key(&index.wallet);
        let value = match serde_json::to_string(index) {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, error = %e, "day index not serializable");
                return WriteOutcome::Skipped;
            }
        };
        let outcome = self.put(&key, &value, &index.wallet).await;
        if outcome.is_stored() {
            debug!(
                wallet = %index.wallet,
                oldest = %index.oldest,
                newest = %index.newest,
                exhausted = index.exhausted,
                "day index updated"
            );
        }
        outcome
    }

    // ─── Clearing ────────────────────────────────────────────────────────────

    /// Remove every cached entry for `wallet`. Returns the number removed.
    pub async fn clear_wallet(&self, wallet: &str) -> usize {
        let prefix = format!("{}:", self.wallet_prefix(wallet));
        self.remove_prefix(&prefix).await
    }

    /// Remove every entry in this store's namespace.
    pub async fn clear_all(&self) -> usize {
        let prefix = format!("{}:", self.namespace);
        self.remove_prefix(&prefix).await
    }

    async fn remove_prefix(&self, prefix: &str) -> usize {
        let keys = match self.kv.keys_with_prefix(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix, error = %e, "cache key scan failed");
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys {
            match self.kv.remove(&key).await {
                Ok(()) => {
                    self.access.lock().unwrap().remove(&key);
                    removed += 1;
                }
                Err(e) => warn!(%key, error = %e, "cache remove failed"),
            }
        }
        removed
    }

    // ─── Writes with quota handling ──────────────────────────────────────────

    async fn put(&self, key: &str, value: &str, wallet: &str) -> WriteOutcome {
        match self.kv.set(key, value).await {
            Ok(()) => return WriteOutcome::Stored,
            Err(e) if e.is_quota() => {
                debug!(%key, error = %e, "quota exceeded; evicting");
            }
            Err(e) => {
                warn!(%key, error = %e, "cache write failed; skipping");
                return WriteOutcome::Skipped;
            }
        }

        let own_prefix = format!("{}:", self.wallet_prefix(wallet));
        let victims = self.eviction_candidates(key, wallet).await;
        let mut evicted = 0;
        let mut evicted_own = false;
        for victim in victims.into_iter().take(self.max_evictions) {
            if let Err(e) = self.evict(&victim).await {
                warn!(key = %victim, error = %e, "eviction failed");
                continue;
            }
            evicted += 1;
            evicted_own |= victim.starts_with(&own_prefix);
            match self.kv.set(key, value).await {
                Ok(()) => {
                    debug!(%key, evicted, evicted_own, "stored after eviction");
                    return WriteOutcome::StoredAfterEviction { evicted, evicted_own };
                }
                Err(e) if e.is_quota() => continue,
                Err(e) => {
                    warn!(%key, error = %e, "cache write failed after eviction; skipping");
                    return WriteOutcome::Skipped;
                }
            }
        }

        warn!(%key, evicted, "cache full; skipping write");
        WriteOutcome::Skipped
    }

    /// Remove a month bucket and the owning wallet's day index, so the index
    /// never claims coverage the buckets no longer hold.
    async fn evict(&self, month_key: &str) -> Result<(), StoreError> {
        self.kv.remove(month_key).await?;
        self.access.lock().unwrap().remove(month_key);
        if let Some((wallet_prefix, _)) = month_key.split_once(MONTH_TAG) {
            self.kv.remove(&format!("{wallet_prefix}{INDEX_TAG}")).await?;
        }
        Ok(())
    }

    /// Month buckets ordered from least to most essential: other wallets
    /// first, then older months, then least recently used.
    ///
    /// An index write never evicts its own wallet's buckets: doing so would
    /// drop days the index is about to vouch for.
    async fn eviction_candidates(&self, writing_key: &str, wallet: &str) -> Vec<String> {
        let ns_prefix = format!("{}:", self.namespace);
        let keys = match self.kv.keys_with_prefix(&ns_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "cache key scan failed");
                return vec![];
            }
        };
        let own_prefix = format!("{}:", self.wallet_prefix(wallet));
        let writing_index = writing_key.ends_with(INDEX_TAG);
        let access = self.access.lock().unwrap();

        let mut candidates: Vec<(bool, YearMonth, u64, String)> = keys
            .into_iter()
            .filter(|k| k != writing_key)
            .filter_map(|k| {
                let (_, month) = k.split_once(MONTH_TAG)?;
                let month: YearMonth = month.parse().ok()?;
                let own = k.starts_with(&own_prefix);
                if own && writing_index {
                    return None;
                }
                let last_used = access.get(&k).copied().unwrap_or(0);
                Some((own, month, last_used, k))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().map(|(_, _, _, k)| k).collect()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
