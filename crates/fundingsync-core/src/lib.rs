//! fundingsync-core — incremental funding-payment acquisition with a monthly cache.
//!
//! # Architecture
//!
//! ```text
//! FundingLoader (session: in-flight guard, generation check)
//!     ├── LoadingState        (phase machine, milestone idempotency)
//!     └── FundingFetcher      (bounded / extended / probe)
//!             ├── compute_missing_range (gap resolver, reads the DayIndex)
//!             ├── FundingSource         (remote API: HTTP or mock)
//!             └── RecordStore           (month buckets + DayIndex, quota eviction)
//!                     ├── CachePolicy   (staleness)
//!                     └── KvStore       (memory / SQLite)
//! ```

pub mod calendar;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod gap;
pub mod kv;
pub mod loading;
pub mod policy;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

pub use calendar::{Clock, FixedClock, SystemClock, YearMonth};
pub use config::SyncConfig;
pub use dedupe::dedupe;
pub use error::{FundingError, StoreError};
pub use events::{ExtendedProgress, FetchCallbacks, FetchEvent, FetchObserver, NoopObserver, ProgressPhase};
pub use fetcher::FundingFetcher;
pub use gap::{compute_missing_range, MissingRange, Need};
pub use kv::{KvStore, MemoryKvStore};
pub use loading::{LoadingState, Phase, Transition};
pub use policy::CachePolicy;
pub use session::{FundingLoader, LoadReport};
pub use source::{FundingSource, MockFundingSource};
pub use store::{Coverage, DayIndex, MonthBucket, RecordStore, WriteOutcome};
pub use types::{FundingPage, FundingRecord, Milestone, RecordKey, Window};
