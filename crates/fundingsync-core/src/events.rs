//! Fetch events and the observers that receive them.
//!
//! The fetcher reports progress as [`FetchEvent`] values. Callers choose how to
//! consume them: collect into a `Vec` and poll, forward into a tokio channel,
//! or register per-kind closures with [`FetchCallbacks`].

use tokio::sync::mpsc;

use crate::error::FundingError;
use crate::types::{FundingRecord, Milestone};

/// Stage of an extended monthly fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    CheckingCache,
    Fetching,
    Complete,
}

/// Month-level progress of an extended fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedProgress {
    pub months_satisfied: usize,
    pub months_total: usize,
    pub phase: ProgressPhase,
}

/// Something observable happened during a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// The request was served from cache without touching the network.
    CacheHit,
    /// Loaded coverage crossed a milestone.
    Milestone(Milestone),
    /// A partial slice arrived (one page, or one batch of months).
    Records {
        records: Vec<FundingRecord>,
        days_loaded: u32,
    },
    Progress(ExtendedProgress),
    /// Final, deduplicated, newest-first result for the requested window.
    Complete { records: Vec<FundingRecord> },
    Failed(FundingError),
}

impl FetchEvent {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::Milestone(_) => "milestone",
            Self::Records { .. } => "records",
            Self::Progress(_) => "progress",
            Self::Complete { .. } => "complete",
            Self::Failed(_) => "failed",
        }
    }
}

// ─── Observers ────────────────────────────────────────────────────────────────

/// Receives fetch events in emission order.
pub trait FetchObserver: Send {
    fn on_event(&mut self, event: FetchEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FetchObserver for NoopObserver {
    fn on_event(&mut self, _event: FetchEvent) {}
}

/// Polling: events accumulate and are inspected afterwards.
impl FetchObserver for Vec<FetchEvent> {
    fn on_event(&mut self, event: FetchEvent) {
        self.push(event);
    }
}

/// Streaming: events are forwarded; a dropped receiver is ignored.
impl FetchObserver for mpsc::UnboundedSender<FetchEvent> {
    fn on_event(&mut self, event: FetchEvent) {
        let _ = self.send(event);
    }
}

impl<T: FetchObserver + ?Sized> FetchObserver for &mut T {
    fn on_event(&mut self, event: FetchEvent) {
        (**self).on_event(event);
    }
}

impl<T: FetchObserver + ?Sized> FetchObserver for Box<T> {
    fn on_event(&mut self, event: FetchEvent) {
        (**self).on_event(event);
    }
}

type Callback<T> = Box<dyn FnMut(T) + Send>;

/// Per-kind closures. Unset kinds are ignored.
#[derive(Default)]
pub struct FetchCallbacks {
    on_cache_hit: Option<Callback<()>>,
    on_milestone: Option<Callback<Milestone>>,
    on_records: Option<Callback<(Vec<FundingRecord>, u32)>>,
    on_progress: Option<Callback<ExtendedProgress>>,
    on_complete: Option<Callback<Vec<FundingRecord>>>,
    on_error: Option<Callback<FundingError>>,
}

impl FetchCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_cache_hit(mut self, f: impl FnMut(()) + Send + 'static) -> Self {
        self.on_cache_hit = Some(Box::new(f));
        self
    }

    pub fn on_milestone(mut self, f: impl FnMut(Milestone) + Send + 'static) -> Self {
        self.on_milestone = Some(Box::new(f));
        self
    }

    /// Called with each partial slice and the cumulative days loaded.
    pub fn on_records(mut self, f: impl FnMut((Vec<FundingRecord>, u32)) + Send + 'static) -> Self {
        self.on_records = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(ExtendedProgress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnMut(Vec<FundingRecord>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(FundingError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl FetchObserver for FetchCallbacks {
    fn on_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::CacheHit => {
                if let Some(f) = self.on_cache_hit.as_mut() {
                    f(())
                }
            }
            FetchEvent::Milestone(m) => {
                if let Some(f) = self.on_milestone.as_mut() {
                    f(m)
                }
            }
            FetchEvent::Records {
                records,
                days_loaded,
            } => {
                if let Some(f) = self.on_records.as_mut() {
                    f((records, days_loaded))
                }
            }
            FetchEvent::Progress(p) => {
                if let Some(f) = self.on_progress.as_mut() {
                    f(p)
                }
            }
            FetchEvent::Complete { records } => {
                if let Some(f) = self.on_complete.as_mut() {
                    f(records)
                }
            }
            FetchEvent::Failed(e) => {
                if let Some(f) = self.on_error.as_mut() {
                    f(e)
                }
            }
        }
    }
}
