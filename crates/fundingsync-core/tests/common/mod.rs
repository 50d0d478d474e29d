//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use fundingsync_core::{
    FixedClock, FundingError, FundingFetcher, FundingPage, FundingRecord, FundingSource,
    MemoryKvStore, MockFundingSource, RecordStore, SyncConfig, YearMonth,
};

pub const HOUR: i64 = 3_600;
pub const DAY: i64 = 86_400;

/// 2024-06-15 12:00:00 UTC
pub const MID_JUNE: i64 = 1_718_452_800;
/// 2024-05-31 12:00:00 UTC
pub const END_OF_MAY: i64 = 1_717_156_800;

pub fn record(i: i64, ts: i64) -> FundingRecord {
    FundingRecord {
        ts,
        tx_sig: format!("tx{i:05}"),
        tx_sig_index: 0,
        market_index: (i % 3) as u16,
        funding_payment: if i % 2 == 0 { 0.25 } else { -0.1 },
        base_asset_amount: 100.0,
    }
}

/// One record every `step` seconds, going back `days` days from `now`.
pub fn history(now: i64, days: i64, step: i64) -> Vec<FundingRecord> {
    (1..)
        .map(|i| (i, now - i * step))
        .take_while(|(_, ts)| *ts >= now - days * DAY)
        .map(|(i, ts)| record(i, ts))
        .collect()
}

pub struct Harness {
    pub source: Arc<MockFundingSource>,
    pub clock: Arc<FixedClock>,
    pub store: Arc<RecordStore>,
    pub fetcher: Arc<FundingFetcher>,
}

pub fn harness(now: i64, source: MockFundingSource) -> Harness {
    harness_with(now, Arc::new(source), SyncConfig::default())
}

pub fn harness_with(now: i64, source: Arc<MockFundingSource>, config: SyncConfig) -> Harness {
    let clock = Arc::new(FixedClock::at_timestamp(now));
    let store = Arc::new(RecordStore::new(Arc::new(MemoryKvStore::new()), &config));
    let fetcher = Arc::new(FundingFetcher::new(
        source.clone(),
        store.clone(),
        clock.clone(),
        config,
    ));
    Harness {
        source,
        clock,
        store,
        fetcher,
    }
}

/// Holds every request until the test hands out permits.
pub struct GatedSource {
    pub inner: MockFundingSource,
    pub gate: Semaphore,
}

impl GatedSource {
    pub fn new(inner: MockFundingSource) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl FundingSource for GatedSource {
    async fn fetch_page(&self, wallet: &str, page: Option<&str>) -> Result<FundingPage, FundingError> {
        let _permit = self.gate.acquire().await.map_err(|e| FundingError::transport(e.to_string()))?;
        self.inner.fetch_page(wallet, page).await
    }

    async fn fetch_month(&self, wallet: &str, month: YearMonth) -> Result<Vec<FundingRecord>, FundingError> {
        let _permit = self.gate.acquire().await.map_err(|e| FundingError::transport(e.to_string()))?;
        self.inner.fetch_month(wallet, month).await
    }
}

/// Like [`harness`], but over a caller-supplied key-value store.
pub fn harness_on(kv: Arc<MemoryKvStore>, source: MockFundingSource) -> Harness {
    let config = SyncConfig::default();
    let clock = Arc::new(FixedClock::at_timestamp(MID_JUNE));
    let store = Arc::new(RecordStore::new(kv, &config));
    let source = Arc::new(source);
    let fetcher = Arc::new(FundingFetcher::new(
        source.clone(),
        store.clone(),
        clock.clone(),
        config,
    ));
    Harness {
        source,
        clock,
        store,
        fetcher,
    }
}
