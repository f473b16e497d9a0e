//! Process-local repositories behind a single mutex.
//!
//! Ordering and tie-breaking mirror the SQLite backend so tests written
//! against one hold for the other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{LogRepository, ModifierRepository, StatusRepository};
use crate::audit::{LogEntry, LogFilter, NewLogEntry};
use crate::error::{Error, Result};
use crate::modifier::{Modifier, ModifierDraft, ModifierFilter};
use crate::types::{RatioSnapshot, Status, Timestamp, UserId};

#[derive(Default)]
struct Inner {
    /// Row sequence is assigned on first insert and kept across upserts.
    statuses: HashMap<UserId, (u64, Status)>,
    status_seq: u64,
    modifiers: BTreeMap<u64, Modifier>,
    modifier_seq: u64,
    logs: Vec<LogEntry>,
    log_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::Poisoned("memory store"))
    }
}

fn snapshot<'a>(rows: impl Iterator<Item = &'a Status>) -> RatioSnapshot {
    let (total, sensitive) = rows.fold((0u64, 0u64), |(t, s), st| (t + 1, s + st.is_sensitive as u64));
    RatioSnapshot::new(total, sensitive)
}

impl StatusRepository for MemoryStore {
    fn get_by_user(&self, user_id: UserId) -> Result<Option<Status>> {
        Ok(self.lock()?.statuses.get(&user_id).map(|(_, s)| s.clone()))
    }

    fn upsert(&self, status: &Status) -> Result<()> {
        let mut inner = self.lock()?;
        let seq = match inner.statuses.get(&status.user_id) {
            Some((seq, _)) => *seq,
            None => {
                inner.status_seq += 1;
                inner.status_seq
            }
        };
        inner.statuses.insert(status.user_id, (seq, status.clone()));
        Ok(())
    }

    fn counts(&self) -> Result<RatioSnapshot> {
        Ok(snapshot(self.lock()?.statuses.values().map(|(_, s)| s)))
    }

    fn recent_counts(&self, window: u32) -> Result<RatioSnapshot> {
        let inner = self.lock()?;
        if window == 0 {
            return Ok(snapshot(inner.statuses.values().map(|(_, s)| s)));
        }
        let mut rows: Vec<&(u64, Status)> = inner.statuses.values().collect();
        rows.sort_by(|a, b| (b.1.detection_ts, b.0).cmp(&(a.1.detection_ts, a.0)));
        Ok(snapshot(rows.into_iter().take(window as usize).map(|(_, s)| s)))
    }

    fn counts_until(&self, ts: Timestamp) -> Result<RatioSnapshot> {
        Ok(snapshot(
            self.lock()?.statuses.values().map(|(_, s)| s).filter(|s| s.detection_ts <= ts),
        ))
    }

}

impl ModifierRepository for MemoryStore {
    fn insert(&self, draft: &ModifierDraft, created_by: UserId, created_ts: Timestamp) -> Result<Modifier> {
        let mut inner = self.lock()?;
        inner.modifier_seq += 1;
        let m = Modifier {
            id: inner.modifier_seq,
            kind: draft.kind,
            target_id: draft.target_id,
            value: draft.value,
            reason: draft.reason.clone(),
            start_ts: draft.start_ts,
            end_ts: draft.end_ts,
            is_active: draft.is_active,
            created_by,
            created_ts,
        };
        inner.modifiers.insert(m.id, m.clone());
        Ok(m)
    }

    fn get(&self, id: u64) -> Result<Option<Modifier>> {
        Ok(self.lock()?.modifiers.get(&id).cloned())
    }

    fn update(&self, modifier: &Modifier) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.modifiers.get_mut(&modifier.id) {
            Some(slot) => {
                *slot = modifier.clone();
                Ok(())
            }
            None => Err(Error::not_found("modifier", modifier.id)),
        }
    }

    fn delete(&self, id: u64) -> Result<bool> {
        Ok(self.lock()?.modifiers.remove(&id).is_some())
    }

    fn list_active(&self, now: Timestamp) -> Result<Vec<Modifier>> {
        Ok(self.lock()?.modifiers.values().filter(|m| m.is_eligible_at(now)).cloned().collect())
    }

    fn list(&self, filter: &ModifierFilter) -> Result<Vec<Modifier>> {
        let inner = self.lock()?;
        let rows = inner.modifiers.values().rev().filter(|m| filter.matches(m)).cloned();
        Ok(match filter.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    fn deactivate_expired(&self, now: Timestamp) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for m in inner.modifiers.values_mut() {
            if m.is_active && m.end_ts.map_or(false, |end| end < now) {
                m.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }
}

impl LogRepository for MemoryStore {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let mut inner = self.lock()?;
        inner.log_seq += 1;
        let entry = entry.into_entry(inner.log_seq);
        inner.logs.push(entry.clone());
        Ok(entry)
    }

    fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let inner = self.lock()?;
        let mut rows: Vec<LogEntry> = inner.logs.iter().filter(|e| filter.matches(e)).cloned().collect();
        rows.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn prune_before(&self, cutoff: Timestamp) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.logs.len();
        inner.logs.retain(|e| e.timestamp >= cutoff);
        Ok(before - inner.logs.len())
    }
}
