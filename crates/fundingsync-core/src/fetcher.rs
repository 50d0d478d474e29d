//! Incremental fetcher — retrieves only what the cache is missing.
//!
//! Three request shapes share one cache:
//!
//! - **bounded**: walks the newest-first paginated endpoint until the gap
//!   resolver's start date is passed, persisting every page as it arrives
//! - **extended**: fills 90/180/365-day windows month by month from the
//!   monthly endpoint, skipping months the cache policy already accepts
//! - **probe**: scans the trailing twelve months when the paginated listing
//!   came back empty, caching confirmed-empty months as it goes
//!
//! Every shape returns a deduplicated, newest-first list and reports progress
//! through a [`FetchObserver`]. Nothing is retried here.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use futures::future::join_all;
use tracing::{debug, info, trace, warn};

use crate::calendar::{date_of, day_start_ts, days_between, Clock, YearMonth};
use crate::config::SyncConfig;
use crate::dedupe::merge_newest_first;
use crate::error::FundingError;
use crate::events::{ExtendedProgress, FetchEvent, FetchObserver, ProgressPhase};
use crate::gap::{compute_missing_range, cutoff_date, MissingRange, Need};
use crate::source::FundingSource;
use crate::store::{Coverage, DayIndex, RecordStore};
use crate::types::{FundingRecord, Milestone, Window};

/// Cache check result for a run of months.
#[derive(Debug, Default)]
struct CachePartition {
    satisfied: usize,
    pending: Vec<YearMonth>,
    records: Vec<FundingRecord>,
}

/// Wall-clock reading shared by one fetch.
#[derive(Debug, Clone, Copy)]
struct Now {
    ts: i64,
    today: NaiveDate,
}

/// Fetches funding history for wallets, backed by a shared [`RecordStore`].
pub struct FundingFetcher {
    source: Arc<dyn FundingSource>,
    store: Arc<RecordStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl FundingFetcher {
    pub fn new(
        source: Arc<dyn FundingSource>,
        store: Arc<RecordStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn now(&self) -> Now {
        let now = self.clock.now();
        Now {
            ts: now.timestamp(),
            today: now.date_naive(),
        }
    }

    /// What a `days`-deep request for `wallet` would have to fetch right now.
    pub async fn missing_range(&self, wallet: &str, days: u32) -> MissingRange {
        let now = self.now();
        let index = self.store.read_index(wallet).await;
        compute_missing_range(index.as_ref(), days, now.today, now.ts, &self.config.policy)
    }

    /// Days of history the day index vouches for right now, counting today.
    ///
    /// Zero when the index is missing, stale, or does not reach today.
    pub async fn cached_days(&self, wallet: &str) -> u32 {
        let now = self.now();
        match self.store.read_index(wallet).await {
            Some(index) if index.newest >= now.today && self.config.policy.is_index_fresh(&index, now.ts) => {
                index.covered_days()
            }
            _ => 0,
        }
    }

    // ─── Bounded paginated fetch ─────────────────────────────────────────────

    /// Fetch the trailing `days` of history through the paginated endpoint.
    pub async fn fetch_incremental(
        &self,
        wallet: &str,
        days: u32,
        observer: &mut dyn FetchObserver,
    ) -> Result<Vec<FundingRecord>, FundingError> {
        let now = self.now();
        let cutoff = cutoff_date(now.today, days);
        let cutoff_ts = day_start_ts(cutoff);
        let index = self.store.read_index(wallet).await;
        let gap = compute_missing_range(index.as_ref(), days, now.today, now.ts, &self.config.policy);

        if gap.need == Need::None {
            let records = self.store.records_since(wallet, cutoff_ts, now.today).await;
            debug!(wallet, days, records = records.len(), "bounded fetch served from cache");
            emit(observer, FetchEvent::CacheHit);
            for milestone in Milestone::crossed(0, days) {
                emit(observer, FetchEvent::Milestone(milestone));
            }
            emit(
                observer,
                FetchEvent::Records {
                    records: records.clone(),
                    days_loaded: days,
                },
            );
            emit(observer, FetchEvent::Complete { records: records.clone() });
            return Ok(records);
        }

        debug!(wallet, days, need = ?gap.need, start = %gap.start_date, "bounded fetch walking pages");
        // Read before the walk: a quota eviction during it may drop buckets
        // this result still has to include.
        let cached = self.store.records_since(wallet, cutoff_ts, now.today).await;
        let stop_ts = day_start_ts(gap.start_date);
        let mut fetched: Vec<FundingRecord> = Vec::new();
        let mut oldest_seen: Option<i64> = None;
        let mut token: Option<String> = None;
        let mut pages = 0u32;
        let mut exhausted: bool;
        let mut reached_start = false;
        let mut writes_ok = true;
        let mut days_loaded = 0u32;

        loop {
            let page = match self.source.fetch_page(wallet, token.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(wallet, pages, error = %e, "page fetch failed");
                    emit(observer, FetchEvent::Failed(e.clone()));
                    return Err(e);
                }
            };
            pages += 1;
            writes_ok &= self.persist(wallet, &page.records, Coverage::Partial, now.ts).await;

            if let Some(oldest) = page.oldest_ts() {
                oldest_seen = Some(oldest_seen.map_or(oldest, |o| o.min(oldest)));
                reached_start = oldest < stop_ts;
            }
            exhausted = page.next_page.is_none();

            let reached = if exhausted || reached_start {
                days
            } else {
                oldest_seen.map_or(0, |o| days_between(o, now.ts)).min(days)
            };
            let in_window: Vec<FundingRecord> =
                page.records.iter().filter(|r| r.ts >= cutoff_ts).cloned().collect();
            emit(
                observer,
                FetchEvent::Records {
                    records: in_window.clone(),
                    days_loaded: reached,
                },
            );
            for milestone in Milestone::crossed(days_loaded, reached) {
                emit(observer, FetchEvent::Milestone(milestone));
            }
            days_loaded = days_loaded.max(reached);
            fetched.extend(in_window);

            match page.next_page {
                Some(next) if !reached_start => {
                    if pages >= self.config.max_pages {
                        warn!(wallet, pages, "page ceiling reached; ending walk");
                        break;
                    }
                    token = Some(next);
                }
                _ => break,
            }
        }

        // Dates strictly newer than the oldest record's day are fully covered;
        // on exhaustion everything older is empty history.
        let floor = match (oldest_seen, exhausted) {
            (Some(oldest), true) => Some(date_of(oldest).min(cutoff)),
            (None, true) => Some(cutoff),
            (Some(oldest), false) => Some(date_of(oldest) + Duration::days(1)),
            (None, false) => None,
        };

        if let Some(floor) = floor {
            let complete_from = match (oldest_seen, exhausted) {
                (Some(oldest), true) => YearMonth::of_timestamp(oldest).first_day(),
                _ => floor,
            };
            if writes_ok {
                writes_ok = self.mark_complete(wallet, complete_from, now).await;
            }
            if writes_ok {
                self.advance_index(wallet, floor, exhausted, now).await;
            } else {
                warn!(wallet, "cache writes incomplete; day index not advanced");
            }
        }

        let records = merge_newest_first(cached, fetched);
        info!(
            wallet,
            days,
            pages,
            records = records.len(),
            exhausted,
            "bounded fetch complete"
        );
        emit(observer, FetchEvent::Complete { records: records.clone() });
        Ok(records)
    }

    // ─── Extended monthly fetch ──────────────────────────────────────────────

    /// Fill an extended window from the monthly endpoint.
    pub async fn fetch_extended(
        &self,
        wallet: &str,
        window: Window,
        observer: &mut dyn FetchObserver,
    ) -> Result<Vec<FundingRecord>, FundingError> {
        let now = self.now();
        let days = window.days();
        let cutoff = cutoff_date(now.today, days);
        let cutoff_ts = day_start_ts(cutoff);
        let index = self.store.read_index(wallet).await;
        let gap = compute_missing_range(index.as_ref(), days, now.today, now.ts, &self.config.policy);

        if gap.need == Need::None {
            let records = self.store.records_since(wallet, cutoff_ts, now.today).await;
            debug!(wallet, %window, records = records.len(), "extended fetch served from cache");
            emit(observer, FetchEvent::CacheHit);
            emit(
                observer,
                FetchEvent::Records {
                    records: records.clone(),
                    days_loaded: days,
                },
            );
            emit(observer, FetchEvent::Complete { records: records.clone() });
            return Ok(records);
        }

        let months = YearMonth::spanning(cutoff.min(gap.start_date), now.today);
        let total = months.len();
        emit(observer, progress(0, total, ProgressPhase::CheckingCache));

        let CachePartition {
            mut satisfied,
            pending,
            records: cached,
        } = self.partition_cached(wallet, &months, now).await;
        debug!(wallet, %window, satisfied, pending = pending.len(), "extended fetch cache check");

        let mut fetched: Vec<FundingRecord> = Vec::new();
        let mut writes_ok = true;
        for batch in pending.chunks(self.config.month_batch_size.max(1)) {
            emit(observer, progress(satisfied, total, ProgressPhase::Fetching));
            let batch_records = match self.fetch_month_batch(wallet, batch, now).await {
                Ok((records, stored)) => {
                    writes_ok &= stored;
                    records
                }
                Err(e) => {
                    warn!(wallet, %window, error = %e, "monthly fetch failed");
                    emit(observer, FetchEvent::Failed(e.clone()));
                    return Err(e);
                }
            };
            satisfied += batch.len();

            let reached = batch
                .last()
                .map_or(0, |oldest| days_between(oldest.start_ts(), now.ts))
                .min(days);
            let in_window: Vec<FundingRecord> =
                batch_records.into_iter().filter(|r| r.ts >= cutoff_ts).collect();
            emit(
                observer,
                FetchEvent::Records {
                    records: in_window.clone(),
                    days_loaded: reached,
                },
            );
            fetched.extend(in_window);
        }

        if let Some(oldest) = months.last() {
            if writes_ok {
                self.advance_index(wallet, oldest.first_day(), false, now).await;
            } else {
                warn!(wallet, %window, "cache writes incomplete; day index not advanced");
            }
        }

        let cached = cached.into_iter().filter(|r| r.ts >= cutoff_ts).collect();
        let records = merge_newest_first(cached, fetched);
        info!(
            wallet,
            %window,
            months = total,
            records = records.len(),
            "extended fetch complete"
        );
        emit(observer, progress(total, total, ProgressPhase::Complete));
        emit(observer, FetchEvent::Complete { records: records.clone() });
        Ok(records)
    }

    // ─── Twelve-month probe ──────────────────────────────────────────────────

    /// Scan the trailing `probe_months` calendar months for any history.
    ///
    /// Every month is visited and cached, including empty ones. Returns
    /// [`FundingError::EmptyHistory`] when nothing is found.
    pub async fn probe_twelve_months(
        &self,
        wallet: &str,
        observer: &mut dyn FetchObserver,
    ) -> Result<Vec<FundingRecord>, FundingError> {
        let now = self.now();
        let months = YearMonth::trailing(now.today, self.config.probe_months);
        let CachePartition {
            pending,
            records: cached,
            ..
        } = self.partition_cached(wallet, &months, now).await;

        let mut fetched = Vec::new();
        let mut writes_ok = true;
        for batch in pending.chunks(self.config.month_batch_size.max(1)) {
            match self.fetch_month_batch(wallet, batch, now).await {
                Ok((records, stored)) => {
                    writes_ok &= stored;
                    fetched.extend(records);
                }
                Err(e) => {
                    warn!(wallet, error = %e, "probe month fetch failed");
                    emit(observer, FetchEvent::Failed(e.clone()));
                    return Err(e);
                }
            }
        }

        let Some(oldest) = months.last() else {
            return Ok(vec![]);
        };
        let records = merge_newest_first(cached, fetched);

        if records.is_empty() {
            info!(wallet, months = months.len(), "probe found no history");
            let err = FundingError::EmptyHistory {
                wallet: wallet.to_string(),
            };
            emit(observer, FetchEvent::Failed(err.clone()));
            return Err(err);
        }

        if writes_ok {
            self.advance_index(wallet, oldest.first_day(), false, now).await;
        }
        let days_loaded = days_between(oldest.start_ts(), now.ts);
        info!(wallet, records = records.len(), "probe found history");
        emit(
            observer,
            FetchEvent::Records {
                records: records.clone(),
                days_loaded,
            },
        );
        emit(observer, FetchEvent::Complete { records: records.clone() });
        Ok(records)
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    /// Split `months` into the ones the cache already satisfies and the ones
    /// that must be fetched, preserving order. Records of satisfied months
    /// are collected up front.
    async fn partition_cached(&self, wallet: &str, months: &[YearMonth], now: Now) -> CachePartition {
        let current = YearMonth::containing(now.today);
        let mut partition = CachePartition::default();
        for &month in months {
            match self.store.read_month(wallet, month).await {
                Some(bucket) if self.config.policy.satisfies(&bucket, month == current, now.ts) => {
                    partition.satisfied += 1;
                    partition.records.extend(bucket.records);
                }
                _ => partition.pending.push(month),
            }
        }
        partition
    }

    /// Fetch a batch of months concurrently and store each as complete.
    ///
    /// Months that arrived are cached even when another month in the batch
    /// failed; the first failure is then returned.
    async fn fetch_month_batch(
        &self,
        wallet: &str,
        batch: &[YearMonth],
        now: Now,
    ) -> Result<(Vec<FundingRecord>, bool), FundingError> {
        let results = join_all(batch.iter().map(|&m| self.source.fetch_month(wallet, m))).await;

        let mut records = Vec::new();
        let mut stored = true;
        let mut first_err = None;
        for (&month, result) in batch.iter().zip(results) {
            match result {
                Ok(month_records) => {
                    trace!(wallet, %month, records = month_records.len(), "month fetched");
                    stored &= self
                        .store
                        .write_month(wallet, month, month_records.clone(), Coverage::Complete, now.ts)
                        .await
                        .keeps_coverage();
                    records.extend(month_records);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok((records, stored)),
        }
    }

    /// Write records into their month buckets. Returns `false` if any write
    /// was skipped or cost the wallet another of its buckets.
    async fn persist(&self, wallet: &str, records: &[FundingRecord], coverage: Coverage, now_ts: i64) -> bool {
        let mut by_month: BTreeMap<YearMonth, Vec<FundingRecord>> = BTreeMap::new();
        for record in records {
            by_month
                .entry(YearMonth::of_timestamp(record.ts))
                .or_default()
                .push(record.clone());
        }
        let mut stored = true;
        for (month, records) in by_month {
            stored &= self
                .store
                .write_month(wallet, month, records, coverage, now_ts)
                .await
                .keeps_coverage();
        }
        stored
    }

    /// Flag every month lying entirely inside `[from, today]` as complete.
    async fn mark_complete(&self, wallet: &str, from: NaiveDate, now: Now) -> bool {
        let mut stored = true;
        for month in YearMonth::spanning(from, now.today) {
            if month.first_day() < from {
                continue;
            }
            stored &= self
                .store
                .write_month(wallet, month, vec![], Coverage::Complete, now.ts)
                .await
                .keeps_coverage();
        }
        stored
    }

    /// Extend the stored index by `[oldest, today]`.
    ///
    /// The index is re-read here rather than carried over from before the
    /// fetch, since an eviction in between may have removed it.
    async fn advance_index(&self, wallet: &str, oldest: NaiveDate, exhausted: bool, now: Now) {
        let index = match self.store.read_index(wallet).await {
            Some(mut index) => {
                if !index.absorb(oldest, now.today, exhausted, now.ts) {
                    warn!(wallet, %oldest, newest = %index.newest, "covered range is disjoint; day index kept");
                    return;
                }
                index
            }
            None => {
                let mut index = DayIndex::new(wallet, oldest, now.today, now.ts);
                index.exhausted = exhausted;
                index
            }
        };
        self.store.write_index(&index).await;
    }
}

fn progress(months_satisfied: usize, months_total: usize, phase: ProgressPhase) -> FetchEvent {
    FetchEvent::Progress(ExtendedProgress {
        months_satisfied,
        months_total,
        phase,
    })
}

fn emit(observer: &mut dyn FetchObserver, event: FetchEvent) {
    trace!(kind = event.kind(), "fetch event");
    observer.on_event(event);
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{FixedClock, SECS_PER_DAY};
    use crate::kv::MemoryKvStore;
    use crate::source::MockFundingSource;

    // 2024-06-15 12:00:00 UTC
    const NOW: i64 = 1_718_452_800;

    fn rec(i: i64, ts: i64) -> FundingRecord {
        FundingRecord {
            ts,
            tx_sig: format!("sig{i}"),
            tx_sig_index: 0,
            market_index: 0,
            funding_payment: 0.01,
            base_asset_amount: 5.0,
        }
    }

    /// One record every 12 hours for `days` days before `NOW`.
    fn history(days: i64) -> Vec<FundingRecord> {
        (1..=days * 2).map(|i| rec(i, NOW - i * SECS_PER_DAY / 2)).collect()
    }

    fn fetcher(source: Arc<MockFundingSource>) -> FundingFetcher {
        let config = SyncConfig::default();
        let store = Arc::new(RecordStore::new(Arc::new(MemoryKvStore::new()), &config));
        FundingFetcher::new(source, store, Arc::new(FixedClock::at_timestamp(NOW)), config)
    }

    #[tokio::test]
    async fn bounded_fetch_stops_at_cutoff() {
        let source = Arc::new(MockFundingSource::new().with_page_size(10).with_history("w", history(60)));
        let f = fetcher(source.clone());
        let mut events = vec![];

        let records = f.fetch_incremental("w", 7, &mut events).await.unwrap();
        let cutoff_ts = day_start_ts(cutoff_date(date_of(NOW), 7));
        assert!(records.iter().all(|r| r.ts >= cutoff_ts));
        // cutoff is 2024-06-08 00:00, exactly fifteen half-days back
        assert_eq!(records.len(), 15);
        assert_eq!(source.page_calls(), 2);
        assert!(events.contains(&FetchEvent::Milestone(Milestone::SevenDays)));
        assert!(matches!(events.last(), Some(FetchEvent::Complete { .. })));

        let index = f.store().read_index("w").await.unwrap();
        assert!(index.covers(cutoff_date(date_of(NOW), 7), date_of(NOW)));
        assert!(!index.exhausted);
    }

    #[tokio::test]
    async fn exhausted_walk_marks_history_complete() {
        let source = Arc::new(MockFundingSource::new().with_page_size(50).with_history("w", history(3)));
        let f = fetcher(source.clone());
        let records = f.fetch_incremental("w", 30, &mut vec![]).await.unwrap();
        assert_eq!(records.len(), 6);

        let index = f.store().read_index("w").await.unwrap();
        assert!(index.exhausted);
        let june = YearMonth::containing(date_of(NOW));
        assert!(f.store().read_month("w", june).await.unwrap().complete);
    }

    #[tokio::test]
    async fn page_failure_is_reported_and_earlier_pages_stay_cached() {
        let source = Arc::new(MockFundingSource::new().with_page_size(4).with_history("w", history(30)));
        source.fail_after(1, FundingError::transport("HTTP 429"));
        let f = fetcher(source.clone());
        let mut events = vec![];

        let err = f.fetch_incremental("w", 30, &mut events).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(events.last(), Some(&FetchEvent::Failed(err)));
        let cached = f
            .store()
            .records_since("w", NOW - 30 * SECS_PER_DAY, date_of(NOW))
            .await;
        assert_eq!(cached.len(), 4);
        assert!(f.store().read_index("w").await.is_none());
    }

    #[tokio::test]
    async fn page_ceiling_ends_walk_without_exhaustion() {
        let source = Arc::new(MockFundingSource::new().with_page_size(2).with_history("w", history(30)));
        let mut f = fetcher(source.clone());
        f.config.max_pages = 3;
        f.fetch_incremental("w", 30, &mut vec![]).await.unwrap();
        assert_eq!(source.page_calls(), 3);
        let index = f.store().read_index("w").await.unwrap();
        assert!(!index.exhausted);
        assert!(index.covered_days() < 30);
    }

    #[tokio::test]
    async fn page_ceiling_never_shrinks_existing_index() {
        let source = Arc::new(MockFundingSource::new().with_page_size(2).with_history("w", history(30)));
        let mut f = fetcher(source.clone());
        f.config.max_pages = 1;
        let old = DayIndex::new("w", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 0);
        f.store().write_index(&old).await;

        f.fetch_incremental("w", 30, &mut vec![]).await.unwrap();
        assert_eq!(source.page_calls(), 1);
        assert_eq!(f.store().read_index("w").await.unwrap(), old);
    }

    #[tokio::test]
    async fn extended_fetch_reports_progress() {
        let source = Arc::new(MockFundingSource::new().with_history("w", history(100)));
        let f = fetcher(source.clone());
        let mut events = vec![];

        let records = f.fetch_extended("w", Window::Day90, &mut events).await.unwrap();
        let cutoff_ts = day_start_ts(cutoff_date(date_of(NOW), 90));
        assert!(records.iter().all(|r| r.ts >= cutoff_ts));
        // 2024-03-17 .. 2024-06-15 spans four months
        assert_eq!(source.month_calls(), 4);
        assert_eq!(
            events.first(),
            Some(&progress(0, 4, ProgressPhase::CheckingCache))
        );
        assert!(events.contains(&progress(4, 4, ProgressPhase::Complete)));

        // a second call inside the freshness window is a pure cache hit
        let mut again = vec![];
        f.fetch_extended("w", Window::Day90, &mut again).await.unwrap();
        assert_eq!(again[0], FetchEvent::CacheHit);
        assert_eq!(source.month_calls(), 4);
    }

    #[tokio::test]
    async fn probe_caches_empty_months() {
        let source = Arc::new(MockFundingSource::new());
        let f = fetcher(source.clone());
        let mut events = vec![];

        let err = f.probe_twelve_months("w", &mut events).await.unwrap_err();
        assert!(err.is_empty_history());
        assert_eq!(source.month_calls(), 12);
        assert_eq!(events.iter().filter(|e| matches!(e, FetchEvent::Failed(_))).count(), 1);

        let months = f.store().cached_months("w").await;
        assert_eq!(months.len(), 12);
        for month in months {
            assert!(f.store().read_month("w", month).await.unwrap().is_confirmed_empty());
        }
    }

    #[tokio::test]
    async fn probe_finds_old_history() {
        // a single record five months back
        let old = rec(1, NOW - 150 * SECS_PER_DAY);
        let source = Arc::new(MockFundingSource::new().with_history("w", vec![old.clone()]));
        let f = fetcher(source.clone());
        let records = f.probe_twelve_months("w", &mut vec![]).await.unwrap();
        assert_eq!(records, vec![old]);
        // every month is visited even after the hit
        assert_eq!(source.month_calls(), 12);
    }
}
