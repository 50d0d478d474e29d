//! The remote funding-payment API as seen by the fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::calendar::YearMonth;
use crate::dedupe::sort_newest_first;
use crate::error::FundingError;
use crate::types::{FundingPage, FundingRecord};

/// Read-only access to a wallet's funding payments.
///
/// Two request shapes exist upstream: a newest-first paginated listing and a
/// complete listing for one calendar month.
#[async_trait]
pub trait FundingSource: Send + Sync {
    /// Fetch one page, newest first. `page` is the token from the previous page.
    async fn fetch_page(&self, wallet: &str, page: Option<&str>) -> Result<FundingPage, FundingError>;

    /// Fetch every record for `month`.
    async fn fetch_month(&self, wallet: &str, month: YearMonth) -> Result<Vec<FundingRecord>, FundingError>;
}

// ─── Mock source ──────────────────────────────────────────────────────────────

/// Scripted in-memory source for tests and demos.
///
/// Serves fixed per-wallet histories, counts every call, and can be told to
/// fail after a number of successful calls.
#[derive(Default)]
pub struct MockFundingSource {
    histories: HashMap<String, Vec<FundingRecord>>,
    page_size: usize,
    page_calls: AtomicUsize,
    month_calls: AtomicUsize,
    months_requested: Mutex<Vec<YearMonth>>,
    failure: Mutex<Option<(usize, FundingError)>>,
}

impl MockFundingSource {
    pub fn new() -> Self {
        Self {
            page_size: 100,
            ..Default::default()
        }
    }

    /// Serve `records` for `wallet` (sorted newest first internally).
    pub fn with_history(mut self, wallet: impl Into<String>, mut records: Vec<FundingRecord>) -> Self {
        sort_newest_first(&mut records);
        self.histories.insert(wallet.into(), records);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fail every call once `after` more calls have succeeded.
    pub fn fail_after(&self, after: usize, error: FundingError) {
        *self.failure.lock().unwrap() = Some((after, error));
    }

    /// Stop failing.
    pub fn heal(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn month_calls(&self) -> usize {
        self.month_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.page_calls() + self.month_calls()
    }

    /// Months passed to `fetch_month`, in call order.
    pub fn months_requested(&self) -> Vec<YearMonth> {
        self.months_requested.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<(), FundingError> {
        let mut failure = self.failure.lock().unwrap();
        match failure.as_mut() {
            Some((0, error)) => Err(error.clone()),
            Some((remaining, _)) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn history(&self, wallet: &str) -> &[FundingRecord] {
        self.histories.get(wallet).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl FundingSource for MockFundingSource {
    async fn fetch_page(&self, wallet: &str, page: Option<&str>) -> Result<FundingPage, FundingError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let offset = match page {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| FundingError::Upstream {
                    status: 400,
                    message: format!("bad page token {token:?}"),
                })?,
            None => 0,
        };
        let history = self.history(wallet);
        let end = (offset + self.page_size).min(history.len());
        let records = history.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page = (end < history.len()).then(|| end.to_string());
        Ok(FundingPage { records, next_page })
    }

    async fn fetch_month(&self, wallet: &str, month: YearMonth) -> Result<Vec<FundingRecord>, FundingError> {
        self.month_calls.fetch_add(1, Ordering::SeqCst);
        self.months_requested.lock().unwrap().push(month);
        self.check_failure()?;

        Ok(self
            .history(wallet)
            .iter()
            .filter(|r| month.contains_ts(r.ts))
            .cloned()
            .collect())
    }
}
