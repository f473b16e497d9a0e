//! Jobs an external scheduler runs periodically. Nothing here triggers
//! itself.

use serde::Serialize;

use crate::audit::AuditLog;
use crate::error::Result;
use crate::logging;
use crate::modifier::ModifierResolver;
use crate::settings::SettingsStore;
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MaintenanceReport {
    pub modifiers_expired: usize,
    /// `None` when retention is unlimited and no prune ran.
    pub log_entries_pruned: Option<usize>,
}

pub struct Maintenance<'a> {
    resolver: &'a ModifierResolver,
    audit: &'a AuditLog,
    settings: &'a dyn SettingsStore,
}

impl<'a> Maintenance<'a> {
    pub fn new(resolver: &'a ModifierResolver, audit: &'a AuditLog, settings: &'a dyn SettingsStore) -> Self {
        Self { resolver, audit, settings }
    }

    /// Deactivate expired modifiers, then prune the audit log when a
    /// retention period is configured.
    pub fn run(&self, now: Timestamp) -> Result<MaintenanceReport> {
        let _scope = logging::ProfileScope::new("maintenance.run");
        let settings = self.settings.current()?;
        let modifiers_expired = self.resolver.sweep_expired(now)?;
        let log_entries_pruned = match settings.log_retention_days {
            0 => None,
            days => Some(self.audit.prune_at(days, now)?),
        };
        Ok(MaintenanceReport { modifiers_expired, log_entries_pruned })
    }
}
