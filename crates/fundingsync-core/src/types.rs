//! Shared types: funding records, pages, display windows and milestones.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

// ─── FundingRecord ────────────────────────────────────────────────────────────

/// One funding-payment event. Immutable once emitted by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRecord {
    /// Occurrence time (epoch seconds).
    #[serde(deserialize_with = "flexible_i64")]
    pub ts: i64,
    /// Transaction signature.
    pub tx_sig: String,
    /// Index of the event within its transaction.
    #[serde(default)]
    pub tx_sig_index: u32,
    /// Perp market identifier.
    #[serde(default)]
    pub market_index: u16,
    /// Signed payment amount (positive = received).
    #[serde(deserialize_with = "flexible_f64")]
    pub funding_payment: f64,
    /// Position size at the time of the payment.
    #[serde(default, deserialize_with = "flexible_f64")]
    pub base_asset_amount: f64,
}

/// Natural identity of a [`FundingRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub tx_sig: String,
    pub tx_sig_index: u32,
}

impl FundingRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            tx_sig: self.tx_sig.clone(),
            tx_sig_index: self.tx_sig_index,
        }
    }
}

/// Accepts a JSON number or a decimal string.
fn flexible_f64<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn flexible_i64<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ─── FundingPage ──────────────────────────────────────────────────────────────

/// One page from the newest-first paginated endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundingPage {
    pub records: Vec<FundingRecord>,
    /// Opaque continuation token; `None` once pagination is exhausted.
    pub next_page: Option<String>,
}

impl FundingPage {
    /// Oldest timestamp on the page, if any.
    pub fn oldest_ts(&self) -> Option<i64> {
        self.records.iter().map(|r| r.ts).min()
    }
}

// ─── Window ───────────────────────────────────────────────────────────────────

/// A trailing display window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "24h")]
    Day1,
    #[serde(rename = "7d")]
    Day7,
    #[serde(rename = "14d")]
    Day14,
    #[serde(rename = "30d")]
    Day30,
    #[serde(rename = "90d")]
    Day90,
    #[serde(rename = "180d")]
    Day180,
    #[serde(rename = "365d")]
    Day365,
}

impl Window {
    pub const ALL: [Window; 7] = [
        Window::Day1,
        Window::Day7,
        Window::Day14,
        Window::Day30,
        Window::Day90,
        Window::Day180,
        Window::Day365,
    ];

    /// Windows filled by the monthly endpoint, in backfill order.
    pub const EXTENDED: [Window; 3] = [Window::Day90, Window::Day180, Window::Day365];

    pub fn days(&self) -> u32 {
        match self {
            Self::Day1 => 1,
            Self::Day7 => 7,
            Self::Day14 => 14,
            Self::Day30 => 30,
            Self::Day90 => 90,
            Self::Day180 => 180,
            Self::Day365 => 365,
        }
    }

    pub fn from_days(days: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.days() == days)
    }

    pub fn is_extended(&self) -> bool {
        self.days() > Milestone::ThirtyDays.days()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day1 => write!(f, "24h"),
            other => write!(f, "{}d", other.days()),
        }
    }
}

// ─── Milestone ────────────────────────────────────────────────────────────────

/// Cumulative coverage crossed a threshold that unlocks UI affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Milestone {
    SevenDays,
    FourteenDays,
    ThirtyDays,
}

impl Milestone {
    pub const ALL: [Milestone; 3] = [
        Milestone::SevenDays,
        Milestone::FourteenDays,
        Milestone::ThirtyDays,
    ];

    pub fn days(&self) -> u32 {
        match self {
            Self::SevenDays => 7,
            Self::FourteenDays => 14,
            Self::ThirtyDays => 30,
        }
    }

    /// Milestones whose threshold is in `(from_days, to_days]`, ascending.
    pub fn crossed(from_days: u32, to_days: u32) -> impl Iterator<Item = Milestone> {
        Self::ALL
            .into_iter()
            .filter(move |m| m.days() > from_days && m.days() <= to_days)
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.days())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
