//! Error types for the funding acquisition pipeline.

use thiserror::Error;

/// Errors surfaced to callers of the fetcher and loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FundingError {
    /// Network unreachable, blocked, or rate-limited.
    ///
    /// Root causes are not distinguished further; see [`FundingError::user_message`].
    #[error("transport error: {detail}")]
    Transport { detail: String },

    /// Non-2xx response that did not look like rate limiting.
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Every strategy, including the twelve-month probe, found zero records.
    #[error("no funding history found for {wallet}")]
    EmptyHistory { wallet: String },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The request could not be built, e.g. the configured URL is malformed.
    ///
    /// Retrying will not help, so this is never reported as transport.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FundingError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            detail: detail.into(),
        }
    }

    /// Returns `true` for transport / rate-limit failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns `true` for the "no history" domain condition.
    pub fn is_empty_history(&self) -> bool {
        matches!(self, Self::EmptyHistory { .. })
    }

    /// Text suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { .. } => {
                "The data provider is rate-limiting requests or is unreachable. Please try again in a moment.".into()
            }
            Self::Upstream { status, .. } => {
                format!("The data provider returned an error (HTTP {status}).")
            }
            Self::EmptyHistory { .. } => "No funding payments found for this account.".into(),
            Self::Decode(_) => "The data provider returned an unexpected response.".into(),
            Self::InvalidRequest(_) => "The request could not be sent. Check the configured API URL.".into(),
        }
    }
}

/// Errors raised by a [`KvStore`](crate::kv::KvStore) backend.
///
/// These never reach fetcher callers: the record store absorbs them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage quota exceeded: need {needed} bytes, capacity {capacity} bytes")]
    QuotaExceeded { needed: usize, capacity: usize },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}
