//! Sync configuration.

use serde::{Deserialize, Serialize};

use crate::policy::CachePolicy;
use crate::types::Window;

/// Configuration shared by the record store, fetcher and loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Key namespace inside the key-value store.
    pub namespace: String,
    /// Number of wallet-address characters kept in store keys.
    pub key_prefix_len: usize,
    /// Maximum buckets evicted to make room for a single write.
    pub max_evictions: usize,
    /// Concurrent monthly requests per batch.
    pub month_batch_size: usize,
    /// Trailing months scanned by the probe.
    pub probe_months: u32,
    /// Upper bound on pages walked by a single bounded fetch.
    pub max_pages: u32,
    /// Extended windows queued after the 30-day range, in order.
    pub extended_windows: Vec<Window>,
    /// Freshness windows.
    pub policy: CachePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "fsync".into(),
            key_prefix_len: 16,
            max_evictions: 16,
            month_batch_size: 3,
            probe_months: 12,
            max_pages: 1_000,
            extended_windows: Window::EXTENDED.to_vec(),
            policy: CachePolicy::default(),
        }
    }
}
