//! Append-only audit trail of detections and administrative actions.
//!
//! Entries are never updated. The only deletion path is retention
//! pruning, which an external scheduler invokes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::directory::UserDirectory;
use crate::error::{Error, Result};
use crate::logging;
use crate::storage::LogRepository;
use crate::types::{now_ts, Actor, StatusValue, Timestamp, UserId};

/// Hard cap on rows in a single export.
pub const MAX_EXPORT_ROWS: usize = 10_000;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

const SECS_PER_DAY: u64 = 86_400;

pub const CSV_HEADER: [&str; 10] = [
    "ID",
    "Timestamp",
    "Member ID",
    "Member Name",
    "Action",
    "Old Value",
    "New Value",
    "Performed By",
    "IP Address",
    "Details",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Detection,
    AdminOverride,
    Reroll,
    ModifierAdded,
    ModifierRemoved,
    SettingsChanged,
    BulkOperation,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Detection => "detection",
            LogAction::AdminOverride => "admin_override",
            LogAction::Reroll => "reroll",
            LogAction::ModifierAdded => "modifier_added",
            LogAction::ModifierRemoved => "modifier_removed",
            LogAction::SettingsChanged => "settings_changed",
            LogAction::BulkOperation => "bulk_operation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "detection" => Ok(LogAction::Detection),
            "admin_override" => Ok(LogAction::AdminOverride),
            "reroll" => Ok(LogAction::Reroll),
            "modifier_added" => Ok(LogAction::ModifierAdded),
            "modifier_removed" => Ok(LogAction::ModifierRemoved),
            "settings_changed" => Ok(LogAction::SettingsChanged),
            "bulk_operation" => Ok(LogAction::BulkOperation),
            other => Err(Error::validation(format!("unknown log action '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub member_id: UserId,
    pub action: LogAction,
    pub old_value: Option<StatusValue>,
    pub new_value: Option<StatusValue>,
    /// `None` for system-initiated entries.
    pub performed_by: Option<UserId>,
    pub ip_address: Option<String>,
    pub timestamp: Timestamp,
    pub details: Option<Value>,
}

/// A row as handed to the repository, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub member_id: UserId,
    pub action: LogAction,
    pub old_value: Option<StatusValue>,
    pub new_value: Option<StatusValue>,
    pub performed_by: Option<UserId>,
    pub ip_address: Option<String>,
    pub timestamp: Timestamp,
    pub details: Option<Value>,
}

impl NewLogEntry {
    pub fn into_entry(self, id: u64) -> LogEntry {
        LogEntry {
            id,
            member_id: self.member_id,
            action: self.action,
            old_value: self.old_value,
            new_value: self.new_value,
            performed_by: self.performed_by,
            ip_address: self.ip_address,
            timestamp: self.timestamp,
            details: self.details,
        }
    }
}

/// What the caller wants recorded; the log assigns the timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    member_id: UserId,
    action: LogAction,
    old_value: Option<StatusValue>,
    new_value: Option<StatusValue>,
    performer: Option<Actor>,
    details: Option<Value>,
}

impl AuditEvent {
    pub fn new(member_id: UserId, action: LogAction) -> Self {
        Self { member_id, action, old_value: None, new_value: None, performer: None, details: None }
    }

    pub fn values(mut self, old: Option<StatusValue>, new: Option<StatusValue>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    pub fn performed_by(mut self, actor: Option<&Actor>) -> Self {
        self.performer = actor.cloned();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn stamp(self, timestamp: Timestamp) -> NewLogEntry {
        let (performed_by, ip_address) = match self.performer {
            Some(actor) => (Some(actor.id), actor.ip_address),
            None => (None, None),
        };
        NewLogEntry {
            member_id: self.member_id,
            action: self.action,
            old_value: self.old_value,
            new_value: self.new_value,
            performed_by,
            ip_address,
            timestamp,
            details: self.details,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub member_id: Option<UserId>,
    pub action: Option<LogAction>,
    pub performed_by: Option<UserId>,
    /// Inclusive lower bound.
    pub since: Option<Timestamp>,
    /// Inclusive upper bound.
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn for_member(member_id: UserId) -> Self {
        Self { member_id: Some(member_id), ..Default::default() }
    }

    pub fn matches(&self, e: &LogEntry) -> bool {
        self.member_id.map_or(true, |m| e.member_id == m)
            && self.action.map_or(true, |a| e.action == a)
            && self.performed_by.map_or(true, |p| e.performed_by == Some(p))
            && self.since.map_or(true, |s| e.timestamp >= s)
            && self.until.map_or(true, |u| e.timestamp <= u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(Error::validation(format!("unknown export format '{}'", other))),
        }
    }
}

pub fn format_ts(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_row(fields: &[String]) -> String {
    fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",")
}

// =============================================================================
// Service
// =============================================================================

#[derive(Clone)]
pub struct AuditLog {
    repo: Arc<dyn LogRepository>,
    directory: Arc<dyn UserDirectory>,
}

impl AuditLog {
    pub fn new(repo: Arc<dyn LogRepository>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { repo, directory }
    }

    pub fn log(&self, event: AuditEvent) -> Result<LogEntry> {
        self.log_at(event, now_ts())
    }

    pub fn log_at(&self, event: AuditEvent, timestamp: Timestamp) -> Result<LogEntry> {
        self.repo.append(event.stamp(timestamp))
    }

    pub fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        self.repo.query(filter)
    }

    pub fn history(&self, member_id: UserId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let filter = LogFilter {
            limit: Some(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
            ..LogFilter::for_member(member_id)
        };
        self.repo.query(&filter)
    }

    fn bounded(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let mut bounded = filter.clone();
        bounded.limit = Some(filter.limit.map_or(MAX_EXPORT_ROWS, |l| l.min(MAX_EXPORT_ROWS)));
        self.repo.query(&bounded)
    }

    fn name_of(&self, id: UserId) -> Option<String> {
        self.directory.lookup(id).map(|u| u.name)
    }

    pub fn export(&self, filter: &LogFilter, format: ExportFormat) -> Result<String> {
        let _scope = logging::ProfileScope::new("audit.export");
        match format {
            ExportFormat::Csv => self.export_csv(filter),
            ExportFormat::Json => self.export_json(filter),
        }
    }

    pub fn export_csv(&self, filter: &LogFilter) -> Result<String> {
        let mut out = csv_row(&CSV_HEADER.map(String::from));
        out.push('\n');
        for e in self.bounded(filter)? {
            let performer = match e.performed_by {
                Some(id) => self.name_of(id).unwrap_or_else(|| format!("#{}", id)),
                None => "System".to_string(),
            };
            let row = [
                e.id.to_string(),
                format_ts(e.timestamp),
                e.member_id.to_string(),
                self.name_of(e.member_id).unwrap_or_else(|| "Unknown".to_string()),
                e.action.as_str().to_string(),
                e.old_value.map(|v| v.as_str().to_string()).unwrap_or_default(),
                e.new_value.map(|v| v.as_str().to_string()).unwrap_or_default(),
                performer,
                e.ip_address.clone().unwrap_or_default(),
                e.details.as_ref().map(|d| d.to_string()).unwrap_or_default(),
            ];
            out.push_str(&csv_row(&row));
            out.push('\n');
        }
        Ok(out)
    }

    pub fn export_json(&self, filter: &LogFilter) -> Result<String> {
        let rows: Vec<Value> = self
            .bounded(filter)?
            .into_iter()
            .map(|e| {
                let performer = e.performed_by.map(|id| {
                    json!({ "id": id, "name": self.name_of(id) })
                });
                json!({
                    "id": e.id,
                    "timestamp": format_ts(e.timestamp),
                    "member": {
                        "id": e.member_id,
                        "name": self.name_of(e.member_id).unwrap_or_else(|| "Unknown".to_string()),
                    },
                    "action": e.action.as_str(),
                    "old_value": e.old_value.map(|v| v.as_str()),
                    "new_value": e.new_value.map(|v| v.as_str()),
                    "performed_by": performer,
                    "ip_address": e.ip_address,
                    "details": e.details,
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    /// Delete entries older than `days_to_keep` days; exact count returned.
    pub fn prune(&self, days_to_keep: u32) -> Result<usize> {
        self.prune_at(days_to_keep, now_ts())
    }

    pub fn prune_at(&self, days_to_keep: u32, now: Timestamp) -> Result<usize> {
        let cutoff = now.saturating_sub(days_to_keep as u64 * SECS_PER_DAY);
        let deleted = self.repo.prune_before(cutoff)?;
        logging::log_prune(days_to_keep, deleted);
        Ok(deleted)
    }
}
