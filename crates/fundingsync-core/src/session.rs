//! Session driver — runs the full load sequence for the active wallet.
//!
//! One [`FundingLoader`] owns the [`LoadingState`] for the wallet currently
//! on screen. A load walks the 30-day range, falls back to the twelve-month
//! probe when that comes back empty, then fills the extended windows in
//! order. Fetch events feed the state machine and the caller's observer.
//!
//! Two guards keep results coherent:
//!
//! - an in-flight set keyed by wallet and generation makes a second `load`
//!   for the same wallet a no-op while the first is running, as long as no
//!   switch happened in between
//! - a generation counter, bumped on every wallet switch, drops events from a
//!   superseded load before they reach the state machine or the observer
//!   (the data they carry is still cached)

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::FundingError;
use crate::events::{FetchEvent, FetchObserver};
use crate::fetcher::FundingFetcher;
use crate::loading::{LoadingState, Phase};
use crate::types::{FundingRecord, Milestone, Window};

/// How a call to [`FundingLoader::load`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadReport {
    /// The sequence ran to its end. `records` is the deepest window loaded.
    Completed {
        phase: Phase,
        records: Vec<FundingRecord>,
    },
    /// Another load for this wallet is still running.
    AlreadyInFlight,
    /// The active wallet changed while loading; remaining work was dropped.
    Superseded,
}

// ─── In-flight guard ──────────────────────────────────────────────────────────

type InFlightSet = Mutex<HashSet<(String, u64)>>;

/// Removes its `(wallet, generation)` entry from the in-flight set on drop.
///
/// A superseded load keeps its entry until it unwinds, but a fresh load of
/// the same wallet runs under a newer generation and is not blocked by it.
struct InFlight<'a> {
    set: &'a InFlightSet,
    key: (String, u64),
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a InFlightSet, wallet: &str, generation: u64) -> Option<Self> {
        let key = (wallet.to_string(), generation);
        if !set.lock().unwrap().insert(key.clone()) {
            return None;
        }
        Some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}

// ─── FundingLoader ────────────────────────────────────────────────────────────

pub struct FundingLoader {
    fetcher: Arc<FundingFetcher>,
    state: Mutex<LoadingState>,
    generation: AtomicU64,
    in_flight: InFlightSet,
}

impl FundingLoader {
    pub fn new(fetcher: Arc<FundingFetcher>) -> Self {
        let state = LoadingState::new(fetcher.config().extended_windows.clone());
        Self {
            fetcher,
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn fetcher(&self) -> &Arc<FundingFetcher> {
        &self.fetcher
    }

    /// Make `wallet` the active wallet. Any load for the previous wallet is
    /// superseded. Returns the new generation.
    pub fn select_wallet(&self, wallet: &str) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().unwrap().reset(wallet);
        info!(wallet, generation, "wallet selected");
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Run the load sequence for `wallet`, selecting it first if needed.
    pub async fn load(
        &self,
        wallet: &str,
        observer: &mut dyn FetchObserver,
    ) -> Result<LoadReport, FundingError> {
        let active = self.state.lock().unwrap().wallet().map(str::to_string);
        let generation = if active.as_deref() == Some(wallet) {
            self.generation.load(Ordering::SeqCst)
        } else {
            self.select_wallet(wallet)
        };

        let Some(_guard) = InFlight::acquire(&self.in_flight, wallet, generation) else {
            debug!(wallet, generation, "load already in flight");
            return Ok(LoadReport::AlreadyInFlight);
        };

        let cached_days = self.fetcher.cached_days(wallet).await;
        if !self.is_current(generation) {
            return Ok(self.superseded(wallet));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.clear_error();
            state.start(cached_days);
        }

        let mut session = SessionObserver {
            loader: self,
            wallet,
            generation,
            inner: observer,
        };

        let mut records = self
            .fetcher
            .fetch_incremental(wallet, Milestone::ThirtyDays.days(), &mut session)
            .await;
        if !self.is_current(generation) {
            return Ok(self.superseded(wallet));
        }

        if matches!(&records, Ok(r) if r.is_empty()) {
            debug!(wallet, "30-day range empty; probing trailing months");
            records = self.fetcher.probe_twelve_months(wallet, &mut session).await;
            if !self.is_current(generation) {
                return Ok(self.superseded(wallet));
            }
        }
        let mut records = records?;

        loop {
            let next = self.state.lock().unwrap().begin_extended();
            let Some(window) = next else { break };

            let result = self.fetcher.fetch_extended(wallet, window, &mut session).await;
            if !self.is_current(generation) {
                return Ok(self.superseded(wallet));
            }
            records = result?;
            self.state.lock().unwrap().complete_window(window);
        }

        let phase = self.current_phase();
        info!(wallet, %phase, records = records.len(), "load finished");
        Ok(LoadReport::Completed { phase, records })
    }

    fn superseded(&self, wallet: &str) -> LoadReport {
        warn!(wallet, "load superseded by wallet switch; fetched data stays cached");
        LoadReport::Superseded
    }

    // ─── Observable state ────────────────────────────────────────────────────

    pub fn current_phase(&self) -> Phase {
        self.state.lock().unwrap().current_phase()
    }

    pub fn currently_fetching_window(&self) -> Option<Window> {
        self.state.lock().unwrap().currently_fetching_window()
    }

    pub fn available_windows(&self) -> Vec<Window> {
        self.state.lock().unwrap().available_windows()
    }

    pub fn disabled_windows(&self) -> Vec<Window> {
        self.state.lock().unwrap().disabled_windows()
    }

    pub fn error(&self) -> Option<FundingError> {
        self.state.lock().unwrap().error().cloned()
    }

    /// Copy of the full machine state.
    pub fn snapshot(&self) -> LoadingState {
        self.state.lock().unwrap().clone()
    }
}

/// Applies fetch events to the state machine, then forwards them, as long
/// as its generation is still current.
struct SessionObserver<'a> {
    loader: &'a FundingLoader,
    wallet: &'a str,
    generation: u64,
    inner: &'a mut dyn FetchObserver,
}

impl FetchObserver for SessionObserver<'_> {
    fn on_event(&mut self, event: FetchEvent) {
        if !self.loader.is_current(self.generation) {
            debug!(wallet = self.wallet, kind = event.kind(), "dropping event from superseded load");
            return;
        }
        {
            let mut state = self.loader.state.lock().unwrap();
            match &event {
                FetchEvent::CacheHit => state.mark_cache_hit(),
                FetchEvent::Milestone(m) => {
                    state.on_milestone(self.wallet, *m);
                }
                FetchEvent::Records { days_loaded, .. } => state.record_progress(*days_loaded),
                FetchEvent::Failed(e) => state.fail(e.clone()),
                FetchEvent::Progress(_) | FetchEvent::Complete { .. } => {}
            }
        }
        self.inner.on_event(event);
    }
}
