//! The user directory collaborator and best-effort profile sync.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::logging;
use crate::types::{UserId, UserSnapshot};

pub mod circuit;

use circuit::CircuitBreaker;

/// Consecutive sync failures before calls are short-circuited.
pub const SYNC_FAILURE_THRESHOLD: u32 = 5;
pub const SYNC_REOPEN_AFTER: Duration = Duration::from_secs(30);

#[async_trait]
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, id: UserId) -> Option<UserSnapshot>;

    /// Every known user id, ascending.
    fn user_ids(&self) -> Vec<UserId>;

    /// Mirror the trait onto the user's visible profile field.
    async fn set_sensitivity_field(&self, user: &UserSnapshot, is_sensitive: bool) -> Result<()>;
}

/// Directory held in process. Sync behavior can be degraded on purpose
/// to exercise failure handling.
#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<BTreeMap<UserId, UserSnapshot>>,
    fields: RwLock<HashMap<UserId, bool>>,
    fail_sync: AtomicBool,
    sync_delay_ms: AtomicU64,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = UserSnapshot>) -> Self {
        let dir = Self::new();
        for u in users {
            dir.add(u);
        }
        dir
    }

    pub fn add(&self, user: UserSnapshot) {
        if let Ok(mut users) = self.users.write() {
            users.insert(user.id, user);
        }
    }

    /// Last value written by a successful sync.
    pub fn field(&self, id: UserId) -> Option<bool> {
        self.fields.read().ok().and_then(|f| f.get(&id).copied())
    }

    pub fn set_sync_failure(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        self.sync_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    fn lookup(&self, id: UserId) -> Option<UserSnapshot> {
        self.users.read().ok().and_then(|u| u.get(&id).cloned())
    }

    fn user_ids(&self) -> Vec<UserId> {
        self.users.read().map(|u| u.keys().copied().collect()).unwrap_or_default()
    }

    async fn set_sensitivity_field(&self, user: &UserSnapshot, is_sensitive: bool) -> Result<()> {
        let delay = self.sync_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(Error::Collaborator(format!("profile store rejected user {}", user.id)));
        }
        self.fields
            .write()
            .map_err(|_| Error::Poisoned("directory fields"))?
            .insert(user.id, is_sensitive);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    Failed,
    TimedOut,
    /// Circuit open; the collaborator was not called.
    Skipped,
}

/// Bounded, non-fatal profile field sync. Never returns an error; the
/// outcome is informational and every failure is logged.
pub struct ProfileSync {
    breaker: Mutex<CircuitBreaker>,
}

impl Default for ProfileSync {
    fn default() -> Self {
        Self::new(SYNC_FAILURE_THRESHOLD, SYNC_REOPEN_AFTER)
    }
}

impl ProfileSync {
    pub fn new(threshold: u32, reopen_after: Duration) -> Self {
        Self { breaker: Mutex::new(CircuitBreaker::new(threshold, reopen_after)) }
    }

    fn admit(&self) -> bool {
        // A poisoned breaker must not block the authoritative write path.
        self.breaker.lock().map(|mut cb| cb.allow_at(Instant::now())).unwrap_or(true)
    }

    fn report(&self, ok: bool) {
        if let Ok(mut cb) = self.breaker.lock() {
            if ok {
                cb.record_success();
            } else {
                cb.record_failure_at(Instant::now());
            }
        }
    }

    pub async fn notify(
        &self,
        directory: &dyn UserDirectory,
        user: &UserSnapshot,
        is_sensitive: bool,
        timeout: Duration,
    ) -> SyncOutcome {
        if !self.admit() {
            logging::log_sync_failure(user.id, "circuit open, sync skipped");
            return SyncOutcome::Skipped;
        }
        match tokio::time::timeout(timeout, directory.set_sensitivity_field(user, is_sensitive)).await {
            Ok(Ok(())) => {
                self.report(true);
                SyncOutcome::Synced
            }
            Ok(Err(e)) => {
                self.report(false);
                logging::log_sync_failure(user.id, &e.to_string());
                SyncOutcome::Failed
            }
            Err(_) => {
                self.report(false);
                logging::log_sync_failure(user.id, &format!("timed out after {}ms", timeout.as_millis()));
                SyncOutcome::TimedOut
            }
        }
    }
}
