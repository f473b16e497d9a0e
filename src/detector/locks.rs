//! Per-user write serialization.
//!
//! Every Status write for a user happens while that user's lock is held,
//! from reading the previous value through appending the audit entry.
//! Entries are created on demand and dropped once nobody holds or waits
//! on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::UserId;

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct UserLocks {
    table: Mutex<HashMap<UserId, Slot>>,
}

pub struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<UserId, Slot>> {
        // The table only holds Arcs; a panic elsewhere cannot corrupt it.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn acquire(&self, user_id: UserId) -> UserGuard<'_> {
        let slot = self.table().entry(user_id).or_default().clone();
        let guard = slot.lock_owned().await;
        UserGuard { locks: self, user_id, guard: Some(guard) }
    }

    /// Users with a live entry.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.locks.table();
        if table.get(&self.user_id).map_or(false, |slot| Arc::strong_count(slot) == 1) {
            table.remove(&self.user_id);
        }
    }
}
