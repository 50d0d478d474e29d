//! End-to-end fetcher behaviour against a scripted source.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use fundingsync_core::calendar::{date_of, day_start_ts};
use fundingsync_core::gap::cutoff_date;
use fundingsync_core::{
    Coverage, ExtendedProgress, FetchEvent, FixedClock, FundingFetcher, MemoryKvStore, Milestone,
    MockFundingSource, ProgressPhase, RecordStore, SyncConfig, Window, YearMonth,
};

use common::*;

fn position(events: &[FetchEvent], wanted: &FetchEvent) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("missing {wanted:?}"))
}

fn is_complete(event: &FetchEvent) -> bool {
    matches!(event, FetchEvent::Complete { .. })
}

#[tokio::test]
async fn thirty_days_out_of_forty_five() {
    let mut records = history(MID_JUNE, 45, 8 * HOUR);
    records.push(record(5, MID_JUNE - 5 * 8 * HOUR)); // served twice upstream
    let h = harness(MID_JUNE, MockFundingSource::new().with_page_size(20).with_history("w", records));
    let mut events = vec![];

    let result = h.fetcher.fetch_incremental("w", 30, &mut events).await.unwrap();

    let cutoff_ts = day_start_ts(cutoff_date(date_of(MID_JUNE), 30));
    assert_eq!(result.len(), 91);
    assert!(result.iter().all(|r| r.ts >= cutoff_ts));
    assert!(result.windows(2).all(|w| w[0].ts >= w[1].ts));
    let keys: HashSet<_> = result.iter().map(|r| r.key()).collect();
    assert_eq!(keys.len(), result.len());

    let seven = position(&events, &FetchEvent::Milestone(Milestone::SevenDays));
    let fourteen = position(&events, &FetchEvent::Milestone(Milestone::FourteenDays));
    let thirty = position(&events, &FetchEvent::Milestone(Milestone::ThirtyDays));
    let done = events.iter().position(is_complete).unwrap();
    assert!(seven < fourteen && fourteen < thirty && thirty < done);
    assert_eq!(done, events.len() - 1);
    // the walk stopped once it passed the cutoff instead of draining all 45 days
    assert!(h.source.page_calls() < 7);
}

#[tokio::test]
async fn repeat_inside_freshness_window_is_a_cache_hit() {
    let h = harness(
        MID_JUNE,
        MockFundingSource::new().with_page_size(20).with_history("w", history(MID_JUNE, 45, 8 * HOUR)),
    );
    let first = h.fetcher.fetch_incremental("w", 30, &mut vec![]).await.unwrap();
    let calls = h.source.page_calls();

    let mut events = vec![];
    let second = h.fetcher.fetch_incremental("w", 30, &mut events).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(h.source.page_calls(), calls);
    assert_eq!(events.first(), Some(&FetchEvent::CacheHit));
    assert!(events.last().map_or(false, is_complete));

    // once the index ages out, only the recent edge is walked again
    h.clock.advance(Duration::seconds(301));
    let mut events = vec![];
    let third = h.fetcher.fetch_incremental("w", 30, &mut events).await.unwrap();
    assert_eq!(third.len(), first.len());
    assert!(!events.contains(&FetchEvent::CacheHit));
    assert_eq!(h.source.page_calls(), calls + 1);
}

#[tokio::test]
async fn extended_fetch_only_requests_unsatisfied_months() {
    let records = history(END_OF_MAY, 100, 12 * HOUR);
    let h = harness(END_OF_MAY, MockFundingSource::new().with_history("w", records.clone()));
    let may = YearMonth::of_timestamp(END_OF_MAY);
    let apr = may.prev();
    let mar = apr.prev();

    let in_month = |m: YearMonth| -> Vec<_> { records.iter().filter(|r| m.contains_ts(r.ts)).cloned().collect() };
    // March and April were fetched after they ended; May is complete but stale
    h.store
        .write_month("w", mar, in_month(mar), Coverage::Complete, mar.end_ts() + 60)
        .await;
    h.store
        .write_month("w", apr, in_month(apr), Coverage::Complete, apr.end_ts() + 60)
        .await;
    h.store
        .write_month("w", may, in_month(may), Coverage::Complete, END_OF_MAY - 600)
        .await;

    let mut events = vec![];
    let result = h.fetcher.fetch_extended("w", Window::Day90, &mut events).await.unwrap();

    assert_eq!(h.source.total_calls(), 1);
    assert_eq!(h.source.months_requested(), vec![may]);

    let progress: Vec<ExtendedProgress> = events
        .iter()
        .filter_map(|e| match e {
            FetchEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    let expected = [
        (0, ProgressPhase::CheckingCache),
        (2, ProgressPhase::Fetching),
        (3, ProgressPhase::Complete),
    ];
    assert_eq!(progress.len(), expected.len());
    for (p, (satisfied, phase)) in progress.iter().zip(expected) {
        assert_eq!((p.months_satisfied, p.months_total, p.phase), (satisfied, 3, phase));
    }

    // 2024-03-02 00:00 is 181 half-days before the clock
    assert_eq!(result.len(), 181);
    assert!(events.last().map_or(false, is_complete));
}

#[tokio::test]
async fn closed_months_are_never_refetched() {
    let h = harness(MID_JUNE, MockFundingSource::new().with_history("w", history(MID_JUNE, 400, DAY)));

    h.fetcher.fetch_extended("w", Window::Day90, &mut vec![]).await.unwrap();
    assert_eq!(h.source.month_calls(), 4);
    h.fetcher.fetch_extended("w", Window::Day180, &mut vec![]).await.unwrap();
    assert_eq!(h.source.month_calls(), 7);

    // a day later only the open current month is stale
    h.clock.advance(Duration::days(1));
    h.fetcher.fetch_extended("w", Window::Day180, &mut vec![]).await.unwrap();
    assert_eq!(h.source.month_calls(), 8);

    let current = YearMonth::of_timestamp(MID_JUNE);
    let requested = h.source.months_requested();
    let past: Vec<_> = requested.iter().filter(|m| **m != current).collect();
    let unique: HashSet<_> = past.iter().collect();
    assert_eq!(unique.len(), past.len());
    assert_eq!(requested.iter().filter(|m| **m == current).count(), 2);
}

#[tokio::test]
async fn coverage_only_grows() {
    let h = harness(
        MID_JUNE,
        MockFundingSource::new().with_page_size(25).with_history("w", history(MID_JUNE, 400, DAY)),
    );

    h.fetcher.fetch_incremental("w", 30, &mut vec![]).await.unwrap();
    let after_30 = h.store.read_index("w").await.unwrap();

    h.fetcher.fetch_extended("w", Window::Day90, &mut vec![]).await.unwrap();
    let after_90 = h.store.read_index("w").await.unwrap();
    assert!(after_90.oldest <= after_30.oldest);
    assert!(after_90.oldest <= cutoff_date(date_of(MID_JUNE), 90));

    h.clock.advance(Duration::minutes(10));
    h.fetcher.fetch_incremental("w", 7, &mut vec![]).await.unwrap();
    let after_7 = h.store.read_index("w").await.unwrap();
    assert!(after_7.oldest <= after_90.oldest);
    assert!(after_7.newest >= after_90.newest);
    assert!(after_7.updated_at > after_90.updated_at);
}

#[tokio::test]
async fn skipped_cache_writes_do_not_advance_the_index() {
    let config = SyncConfig::default();
    let source = Arc::new(MockFundingSource::new().with_history("w", history(MID_JUNE, 20, 6 * HOUR)));
    // room for a handful of records, not a month of them
    let store = Arc::new(RecordStore::new(Arc::new(MemoryKvStore::with_capacity_bytes(400)), &config));
    let fetcher = FundingFetcher::new(
        source.clone(),
        store.clone(),
        Arc::new(FixedClock::at_timestamp(MID_JUNE)),
        config,
    );

    let result = fetcher.fetch_incremental("w", 7, &mut vec![]).await.unwrap();
    // results still come back from memory: 2024-06-08 00:00 is 30 quarter-days back
    assert_eq!(result.len(), 30);
    assert!(store.read_index("w").await.is_none());
}

#[tokio::test]
async fn own_evictions_never_leave_the_index_claiming_lost_months() {
    let config = SyncConfig::default();
    let base = history(MID_JUNE, 400, DAY);

    // size the cache to hold exactly the first 90-day fill
    let sizing = Arc::new(MemoryKvStore::new());
    let sized = harness_on(sizing.clone(), MockFundingSource::new().with_history("w", base.clone()));
    sized.fetcher.fetch_extended("w", Window::Day90, &mut vec![]).await.unwrap();

    let kv = Arc::new(MemoryKvStore::with_capacity_bytes(sizing.used_bytes() + 50));
    let first = harness_on(kv, MockFundingSource::new().with_history("w", base.clone()));
    first.fetcher.fetch_extended("w", Window::Day90, &mut vec![]).await.unwrap();
    assert!(first.store.read_index("w").await.is_some());

    // June grows past the spare room, so rewriting it evicts March
    let mut grown = base;
    grown.extend((0..20).map(|k| record(1_000 + k, MID_JUNE - 3 * HOUR - k * 6 * HOUR)));
    first.clock.advance(Duration::minutes(10));
    let source = Arc::new(MockFundingSource::new().with_history("w", grown.clone()));
    let fetcher = FundingFetcher::new(source.clone(), first.store.clone(), first.clock.clone(), config);

    let cutoff_ts = day_start_ts(cutoff_date(date_of(MID_JUNE), 90));
    let expected: HashSet<String> = grown
        .iter()
        .filter(|r| r.ts >= cutoff_ts)
        .map(|r| r.tx_sig.clone())
        .collect();

    let result = fetcher.fetch_extended("w", Window::Day90, &mut vec![]).await.unwrap();
    assert_eq!(result.iter().map(|r| r.tx_sig.clone()).collect::<HashSet<_>>(), expected);
    assert_eq!(result.len(), expected.len());
    let march = YearMonth::new(2024, 3).unwrap();
    assert!(first.store.read_month("w", march).await.is_none());
    if let Some(index) = first.store.read_index("w").await {
        for month in YearMonth::spanning(index.oldest, index.newest) {
            assert!(first.store.read_month("w", month).await.is_some(), "index claims evicted {month}");
        }
    }

    // the next request goes back to the source for what was lost
    let calls = source.month_calls();
    let mut events = vec![];
    let again = fetcher.fetch_extended("w", Window::Day90, &mut events).await.unwrap();
    assert!(!events.contains(&FetchEvent::CacheHit));
    assert!(source.month_calls() > calls);
    assert_eq!(again.iter().map(|r| r.tx_sig.clone()).collect::<HashSet<_>>(), expected);
    assert_eq!(again.len(), expected.len());
}
