//! fundingsync-http — `FundingSource` over the public funding-payment REST API.
//!
//! Two endpoints are used:
//!
//! ```text
//! GET {base}/user/{wallet}/fundingPayments[?page=TOKEN]     newest first, paginated
//! GET {base}/user/{wallet}/fundingPayments/{year}/{month}   one calendar month
//! ```
//!
//! Requests are paced client-side by a token bucket and never retried; the
//! caller decides whether to try again.

pub mod classify;
pub mod client;
pub mod pacing;

pub use client::{HttpFundingSource, HttpSourceConfig};
pub use pacing::{PacingConfig, TokenBucket};
