//! Repository contracts the detector depends on, plus an in-memory and a
//! SQLite implementation.

use crate::audit::{LogEntry, LogFilter, NewLogEntry};
use crate::error::Result;
use crate::modifier::{Modifier, ModifierDraft, ModifierFilter};
use crate::types::{RatioSnapshot, Status, Timestamp, UserId};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One current status row per user.
pub trait StatusRepository: Send + Sync {
    fn get_by_user(&self, user_id: UserId) -> Result<Option<Status>>;

    /// Insert or overwrite the user's row in place.
    fn upsert(&self, status: &Status) -> Result<()>;

    /// All-time counts.
    fn counts(&self) -> Result<RatioSnapshot>;

    /// Counts over the `window` most recent rows by detection time.
    fn recent_counts(&self, window: u32) -> Result<RatioSnapshot>;

    /// Counts over rows detected at or before `ts`.
    fn counts_until(&self, ts: Timestamp) -> Result<RatioSnapshot>;
}

pub trait ModifierRepository: Send + Sync {
    fn insert(&self, draft: &ModifierDraft, created_by: UserId, created_ts: Timestamp) -> Result<Modifier>;

    fn get(&self, id: u64) -> Result<Option<Modifier>>;

    /// Fails with `NotFound` when the id is unknown.
    fn update(&self, modifier: &Modifier) -> Result<()>;

    /// Returns whether a row was removed.
    fn delete(&self, id: u64) -> Result<bool>;

    /// Modifiers eligible at `now`: active and inside their window.
    fn list_active(&self, now: Timestamp) -> Result<Vec<Modifier>>;

    /// Newest first.
    fn list(&self, filter: &ModifierFilter) -> Result<Vec<Modifier>>;

    /// Deactivate every active modifier whose end lies before `now`.
    fn deactivate_expired(&self, now: Timestamp) -> Result<usize>;
}

pub trait LogRepository: Send + Sync {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry>;

    /// Newest first (timestamp, then id).
    fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>>;

    /// Delete entries strictly older than `cutoff`; returns the exact count.
    fn prune_before(&self, cutoff: Timestamp) -> Result<usize>;
}
