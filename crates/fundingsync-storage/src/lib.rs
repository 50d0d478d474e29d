//! fundingsync-storage — persistent key-value backends for the record store.
//!
//! Backends:
//! - `MemoryKvStore` (in `fundingsync-core`) — in-memory, no persistence
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteKvStore, StorageUsage};
