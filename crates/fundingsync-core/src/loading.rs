//! Loading state machine — sequences which window is being populated and what
//! may be shown meanwhile.
//!
//! ```text
//! Idle → LoadingShortRange → ShortRangeLoaded → LoadingMediumRange
//!      → MediumRangeLoaded → LoadingExtended(90d) → … → Complete
//! ```
//!
//! The phase never moves backwards within one wallet session. Milestones are
//! applied at most once per wallet, so a late or repeated signal is harmless.
//! Errors are recorded next to the phase rather than replacing it.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use tracing::{debug, info};

use crate::error::FundingError;
use crate::types::{Milestone, Window};

/// Loading phase of one wallet session.
///
/// `ShortRangeLoaded` is transient: the 7-day milestone passes through it and
/// lands on `LoadingMediumRange` in the same step, because the medium range
/// is fetched by the walk that is already running. It is logged as a phase
/// change but never returned by [`LoadingState::current_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    LoadingShortRange,
    ShortRangeLoaded,
    LoadingMediumRange,
    MediumRangeLoaded,
    LoadingExtended(Window),
    Complete,
}

impl Phase {
    /// Total order used to reject backward transitions.
    fn rank(&self) -> (u8, u32) {
        match self {
            Self::Idle => (0, 0),
            Self::LoadingShortRange => (1, 0),
            Self::ShortRangeLoaded => (2, 0),
            Self::LoadingMediumRange => (3, 0),
            Self::MediumRangeLoaded => (4, 0),
            Self::LoadingExtended(w) => (5, w.days()),
            Self::Complete => (6, 0),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            Self::LoadingShortRange | Self::LoadingMediumRange | Self::LoadingExtended(_)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LoadingShortRange => write!(f, "loading-short-range"),
            Self::ShortRangeLoaded => write!(f, "short-range-loaded"),
            Self::LoadingMediumRange => write!(f, "loading-medium-range"),
            Self::MediumRangeLoaded => write!(f, "medium-range-loaded"),
            Self::LoadingExtended(w) => write!(f, "loading-extended({w})"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Effect of feeding a signal into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: Phase, to: Phase },
    /// Accepted, but the phase stayed where it was.
    Unchanged,
    /// Rejected: wrong wallet, duplicate milestone, or out of sequence.
    Ignored,
}

// ─── LoadingState ─────────────────────────────────────────────────────────────

/// Per-session loading state.
#[derive(Debug, Clone)]
pub struct LoadingState {
    wallet: Option<String>,
    phase: Phase,
    days_loaded: u32,
    pending: VecDeque<Window>,
    extended_windows: Vec<Window>,
    cache_hit: bool,
    error: Option<FundingError>,
    applied: HashSet<(String, Milestone)>,
}

impl Default for LoadingState {
    fn default() -> Self {
        Self::new(Window::EXTENDED.to_vec())
    }
}

impl LoadingState {
    /// `extended_windows` are queued, in order, once 30 days are loaded.
    pub fn new(extended_windows: Vec<Window>) -> Self {
        Self {
            wallet: None,
            phase: Phase::Idle,
            days_loaded: 0,
            pending: VecDeque::new(),
            extended_windows,
            cache_hit: false,
            error: None,
            applied: HashSet::new(),
        }
    }

    /// Begin a fresh session for `wallet`, discarding all progress.
    pub fn reset(&mut self, wallet: impl Into<String>) {
        let wallet = wallet.into();
        debug!(%wallet, "loading state reset");
        self.wallet = Some(wallet);
        self.phase = Phase::Idle;
        self.days_loaded = 0;
        self.pending.clear();
        self.cache_hit = false;
        self.error = None;
        self.applied.clear();
    }

    /// Leave `Idle`, skipping ahead when `cached_days` are already covered.
    pub fn start(&mut self, cached_days: u32) -> Transition {
        if self.phase != Phase::Idle {
            return Transition::Ignored;
        }
        self.days_loaded = cached_days;
        let target = if cached_days >= Milestone::ThirtyDays.days() {
            for m in Milestone::ALL {
                self.mark_applied(m);
            }
            self.seed_queue();
            if self.pending.is_empty() {
                Phase::Complete
            } else {
                Phase::MediumRangeLoaded
            }
        } else if cached_days >= Milestone::SevenDays.days() {
            self.mark_applied(Milestone::SevenDays);
            if cached_days >= Milestone::FourteenDays.days() {
                self.mark_applied(Milestone::FourteenDays);
            }
            Phase::LoadingMediumRange
        } else {
            Phase::LoadingShortRange
        };
        self.advance_to(target)
    }

    /// Apply a milestone for `wallet`. Signals for another wallet, repeats,
    /// and milestones already surpassed never move the phase.
    pub fn on_milestone(&mut self, wallet: &str, milestone: Milestone) -> Transition {
        if self.wallet.as_deref() != Some(wallet) {
            debug!(wallet, %milestone, "milestone for inactive wallet ignored");
            return Transition::Ignored;
        }
        if !self.mark_applied(milestone) {
            return Transition::Ignored;
        }
        self.days_loaded = self.days_loaded.max(milestone.days());

        match milestone {
            Milestone::SevenDays => {
                let from = self.phase;
                self.advance_to(Phase::ShortRangeLoaded);
                match self.advance_to(Phase::LoadingMediumRange) {
                    Transition::Advanced { to, .. } => Transition::Advanced { from, to },
                    other => other,
                }
            }
            Milestone::FourteenDays => Transition::Unchanged,
            Milestone::ThirtyDays => {
                if self.phase.rank() >= Phase::MediumRangeLoaded.rank() {
                    return Transition::Unchanged;
                }
                self.seed_queue();
                self.advance_to(Phase::MediumRangeLoaded)
            }
        }
    }

    /// Record coverage reported by a partial result.
    pub fn record_progress(&mut self, days_loaded: u32) {
        self.days_loaded = self.days_loaded.max(days_loaded);
    }

    pub fn mark_cache_hit(&mut self) {
        self.cache_hit = true;
    }

    /// Enter (or stay in) the extended phase for the next queued window.
    ///
    /// Returns the window to fetch, or `None` when nothing is queued.
    pub fn begin_extended(&mut self) -> Option<Window> {
        match self.phase {
            Phase::LoadingExtended(w) => Some(w),
            Phase::MediumRangeLoaded => match self.pending.front().copied() {
                Some(next) => {
                    self.advance_to(Phase::LoadingExtended(next));
                    Some(next)
                }
                None => {
                    self.advance_to(Phase::Complete);
                    None
                }
            },
            _ => None,
        }
    }

    /// Mark `window` loaded and move on to the next queued window.
    pub fn complete_window(&mut self, window: Window) -> Transition {
        if self.phase != Phase::LoadingExtended(window) {
            return Transition::Ignored;
        }
        self.pending.retain(|w| *w != window);
        self.days_loaded = self.days_loaded.max(window.days());
        match self.pending.front().copied() {
            Some(next) => self.advance_to(Phase::LoadingExtended(next)),
            None => self.advance_to(Phase::Complete),
        }
    }

    /// Record a failure without touching the phase or loaded data.
    pub fn fail(&mut self, error: FundingError) {
        debug!(phase = %self.phase, error = %error, "loading error recorded");
        self.error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn wallet(&self) -> Option<&str> {
        self.wallet.as_deref()
    }

    pub fn current_phase(&self) -> Phase {
        self.phase
    }

    pub fn days_loaded(&self) -> u32 {
        self.days_loaded
    }

    pub fn pending_windows(&self) -> Vec<Window> {
        self.pending.iter().copied().collect()
    }

    pub fn cache_hit(&self) -> bool {
        self.cache_hit
    }

    pub fn error(&self) -> Option<&FundingError> {
        self.error.as_ref()
    }

    /// The single window currently being fetched, if any.
    pub fn currently_fetching_window(&self) -> Option<Window> {
        match self.phase {
            Phase::LoadingShortRange => Some(Window::Day7),
            Phase::LoadingMediumRange => Some(Window::Day30),
            Phase::LoadingExtended(w) => Some(w),
            _ => None,
        }
    }

    /// Windows whose data is fully loaded and may be shown.
    pub fn available_windows(&self) -> Vec<Window> {
        Window::ALL
            .into_iter()
            .filter(|w| self.is_available(*w))
            .collect()
    }

    /// Windows that must stay disabled until more data arrives.
    pub fn disabled_windows(&self) -> Vec<Window> {
        Window::ALL
            .into_iter()
            .filter(|w| !self.is_available(*w))
            .collect()
    }

    fn is_available(&self, window: Window) -> bool {
        self.phase == Phase::Complete || window.days() <= self.days_loaded
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    /// Returns `false` if `milestone` was already applied for this wallet.
    fn mark_applied(&mut self, milestone: Milestone) -> bool {
        let wallet = self.wallet.clone().unwrap_or_default();
        self.applied.insert((wallet, milestone))
    }

    fn seed_queue(&mut self) {
        let loaded = self.days_loaded;
        self.pending = self
            .extended_windows
            .iter()
            .copied()
            .filter(|w| w.days() > loaded)
            .collect();
    }

    fn advance_to(&mut self, target: Phase) -> Transition {
        let from = self.phase;
        if target.rank() <= from.rank() {
            return Transition::Unchanged;
        }
        self.phase = target;
        info!(
            wallet = self.wallet.as_deref().unwrap_or(""),
            %from,
            to = %target,
            days_loaded = self.days_loaded,
            "loading phase advanced"
        );
        Transition::Advanced { from, to: target }
    }
}
