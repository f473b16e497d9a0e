//! Scoped, time-windowed probability modifiers and their resolution.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::logging;
use crate::storage::ModifierRepository;
use crate::types::{GroupId, Timestamp, UserId, UserSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifierKind {
    Member,
    Group,
    Global,
    Event,
}

impl ModifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifierKind::Member => "member",
            ModifierKind::Group => "group",
            ModifierKind::Global => "global",
            ModifierKind::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "member" => Ok(ModifierKind::Member),
            "group" => Ok(ModifierKind::Group),
            "global" => Ok(ModifierKind::Global),
            "event" => Ok(ModifierKind::Event),
            other => Err(Error::validation(format!("unknown modifier type '{}'", other))),
        }
    }

    fn needs_target(&self) -> bool {
        matches!(self, ModifierKind::Member | ModifierKind::Group)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub id: u64,
    pub kind: ModifierKind,
    /// User id for member modifiers, group id for group modifiers.
    pub target_id: Option<u64>,
    /// Signed probability delta in [-1, 1].
    pub value: f64,
    pub reason: Option<String>,
    pub start_ts: Option<Timestamp>,
    pub end_ts: Option<Timestamp>,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_ts: Timestamp,
}

impl Modifier {
    /// Active flag set and `now` inside the (inclusive) window.
    pub fn is_eligible_at(&self, now: Timestamp) -> bool {
        self.is_active
            && self.start_ts.map_or(true, |start| now >= start)
            && self.end_ts.map_or(true, |end| now <= end)
    }

    pub fn applies_to(&self, user: &UserSnapshot) -> bool {
        match self.kind {
            ModifierKind::Global | ModifierKind::Event => true,
            ModifierKind::Member => self.target_id == Some(user.id),
            ModifierKind::Group => self.target_id.map_or(false, |g: GroupId| user.in_group(g)),
        }
    }

    /// Copy the editable fields of a validated draft onto this modifier.
    pub fn apply_draft(&mut self, draft: &ModifierDraft) {
        self.kind = draft.kind;
        self.target_id = draft.target_id;
        self.value = draft.value;
        self.reason = draft.reason.clone();
        self.start_ts = draft.start_ts;
        self.end_ts = draft.end_ts;
        self.is_active = draft.is_active;
    }
}

/// Administrator input for creating or editing a modifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierDraft {
    pub kind: ModifierKind,
    pub target_id: Option<u64>,
    pub value: f64,
    pub reason: Option<String>,
    pub start_ts: Option<Timestamp>,
    pub end_ts: Option<Timestamp>,
    pub is_active: bool,
}

impl ModifierDraft {
    pub fn new(kind: ModifierKind, target_id: Option<u64>, value: f64) -> Self {
        Self { kind, target_id, value, reason: None, start_ts: None, end_ts: None, is_active: true }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_window(mut self, start_ts: Option<Timestamp>, end_ts: Option<Timestamp>) -> Self {
        self.start_ts = start_ts;
        self.end_ts = end_ts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind.needs_target() && self.target_id.is_none() {
            return Err(Error::validation(format!("{} modifier requires a target", self.kind.as_str())));
        }
        if !self.kind.needs_target() && self.target_id.is_some() {
            return Err(Error::validation(format!("{} modifier must not have a target", self.kind.as_str())));
        }
        if !self.value.is_finite() || !(-1.0..=1.0).contains(&self.value) {
            return Err(Error::validation(format!("modifier value must be within [-1, 1], got {}", self.value)));
        }
        if let (Some(start), Some(end)) = (self.start_ts, self.end_ts) {
            if end < start {
                return Err(Error::validation("modifier ends before it starts"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModifierFilter {
    pub kind: Option<ModifierKind>,
    pub is_active: Option<bool>,
    pub target_id: Option<u64>,
    pub limit: Option<usize>,
}

impl ModifierFilter {
    pub fn matches(&self, m: &Modifier) -> bool {
        self.kind.map_or(true, |k| m.kind == k)
            && self.is_active.map_or(true, |a| m.is_active == a)
            && self.target_id.map_or(true, |t| m.target_id == Some(t))
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves which modifiers apply to a user right now and sums them.
#[derive(Clone)]
pub struct ModifierResolver {
    repo: Arc<dyn ModifierRepository>,
}

impl ModifierResolver {
    pub fn new(repo: Arc<dyn ModifierRepository>) -> Self {
        Self { repo }
    }

    pub fn list_applicable(&self, user: &UserSnapshot, now: Timestamp) -> Result<Vec<Modifier>> {
        Ok(self
            .repo
            .list_active(now)?
            .into_iter()
            // The repository pre-filters; re-check so every backend agrees.
            .filter(|m| m.is_eligible_at(now) && m.applies_to(user))
            .collect())
    }

    /// Plain sum of applicable values, uncapped. The engine clamps later.
    pub fn sum(&self, user: &UserSnapshot, now: Timestamp) -> Result<f64> {
        Ok(self.list_applicable(user, now)?.iter().map(|m| m.value).sum())
    }

    /// Idempotent; invoked by the scheduler, never self-triggered.
    pub fn sweep_expired(&self, now: Timestamp) -> Result<usize> {
        let count = self.repo.deactivate_expired(now)?;
        logging::log_sweep(count);
        Ok(count)
    }
}
