//! Administrative operations on modifiers and settings. Permission checks
//! belong to the host; every change here is attributed to an `Actor`.

use serde_json::{json, Value};

use super::Detector;
use crate::audit::{AuditEvent, LogAction};
use crate::error::{Error, Result};
use crate::logging;
use crate::modifier::{Modifier, ModifierDraft, ModifierFilter, ModifierKind};
use crate::settings::{self, Settings};
use crate::types::{now_ts, Actor, UserId};

/// Member modifiers are filed under the member they target; everything
/// else under the administrator who made the change.
fn audit_subject(m: &Modifier, admin: &Actor) -> UserId {
    match (m.kind, m.target_id) {
        (ModifierKind::Member, Some(target)) => target,
        _ => admin.id,
    }
}

fn modifier_details(m: &Modifier) -> Value {
    json!({
        "modifier_id": m.id,
        "type": m.kind.as_str(),
        "target_id": m.target_id,
        "value": m.value,
        "reason": m.reason,
    })
}

fn log_modifier_event(event: &str, m: &Modifier, admin: &Actor) {
    logging::log(
        logging::Level::Info,
        logging::Domain::Modifier,
        event,
        logging::obj(&[
            ("modifier_id", json!(m.id)),
            ("admin_id", json!(admin.id)),
            ("type", logging::v_str(m.kind.as_str())),
            ("value", logging::v_num(m.value)),
            ("is_active", json!(m.is_active)),
        ]),
    );
}

impl Detector {
    pub fn create_modifier(&self, draft: &ModifierDraft, admin: &Actor) -> Result<Modifier> {
        draft.validate()?;
        let m = self.modifiers.insert(draft, admin.id, now_ts())?;
        self.audit.log(
            AuditEvent::new(audit_subject(&m, admin), LogAction::ModifierAdded)
                .performed_by(Some(admin))
                .details(modifier_details(&m)),
        )?;
        log_modifier_event("modifier_created", &m, admin);
        Ok(m)
    }

    pub fn modifier(&self, id: u64) -> Result<Modifier> {
        self.modifiers.get(id)?.ok_or_else(|| Error::not_found("modifier", id))
    }

    pub fn update_modifier(&self, id: u64, draft: &ModifierDraft, admin: &Actor) -> Result<Modifier> {
        draft.validate()?;
        let mut m = self.modifier(id)?;
        m.apply_draft(draft);
        self.modifiers.update(&m)?;
        log_modifier_event("modifier_updated", &m, admin);
        Ok(m)
    }

    /// Flip the active flag without touching the window.
    pub fn set_modifier_active(&self, id: u64, active: bool, admin: &Actor) -> Result<Modifier> {
        let mut m = self.modifier(id)?;
        m.is_active = active;
        self.modifiers.update(&m)?;
        log_modifier_event("modifier_toggled", &m, admin);
        Ok(m)
    }

    pub fn delete_modifier(&self, id: u64, admin: &Actor) -> Result<()> {
        let m = self.modifier(id)?;
        if !self.modifiers.delete(id)? {
            return Err(Error::not_found("modifier", id));
        }
        self.audit.log(
            AuditEvent::new(audit_subject(&m, admin), LogAction::ModifierRemoved)
                .performed_by(Some(admin))
                .details(modifier_details(&m)),
        )?;
        log_modifier_event("modifier_deleted", &m, admin);
        Ok(())
    }

    pub fn list_modifiers(&self, filter: &ModifierFilter) -> Result<Vec<Modifier>> {
        self.modifiers.list(filter)
    }

    /// Modifiers eligible right now.
    pub fn count_active_modifiers(&self) -> Result<usize> {
        Ok(self.modifiers.list_active(now_ts())?.len())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn export_settings(&self) -> Result<Value> {
        Ok(settings::export_document(&self.settings.current()?, now_ts()))
    }

    /// All-or-nothing import. Returns the keys that changed.
    pub fn import_settings(&self, raw: &str, admin: &Actor) -> Result<Vec<String>> {
        let current = self.settings.current()?;
        let (next, changed) = settings::import_document(raw, &current)?;
        self.apply_settings(next, changed, "import", admin)
    }

    pub fn reset_settings(&self, admin: &Actor) -> Result<Vec<String>> {
        let current = self.settings.current()?;
        let defaults = Settings::defaults();
        let changed = settings::changed_keys(&current, &defaults);
        self.apply_settings(defaults, changed, "reset", admin)
    }

    fn apply_settings(&self, next: Settings, changed: Vec<String>, source: &str, admin: &Actor) -> Result<Vec<String>> {
        if changed.is_empty() {
            return Ok(changed);
        }
        self.settings.replace(next)?;
        self.audit.log(
            AuditEvent::new(admin.id, LogAction::SettingsChanged)
                .performed_by(Some(admin))
                .details(json!({ "source": source, "keys": changed, "changed_by": admin.id })),
        )?;
        logging::log_settings_change(admin.id, source, &changed);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogFilter;
    use crate::detector::Backends;
    use crate::directory::MemoryDirectory;
    use crate::settings::EnforcementMode;
    use std::sync::Arc;

    fn detector() -> Detector {
        Detector::new(Backends::memory(Settings::defaults()), Arc::new(MemoryDirectory::new()))
    }

    fn admin() -> Actor {
        Actor::new(1)
    }

    #[test]
    fn test_create_rejects_invalid_draft_without_writing() {
        let det = detector();
        let err = det.create_modifier(&ModifierDraft::new(ModifierKind::Member, None, 0.1), &admin()).unwrap_err();
        assert!(err.is_validation());
        assert!(det.list_modifiers(&ModifierFilter::default()).unwrap().is_empty());
        assert!(det.audit().query(&LogFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_add_and_remove_are_audited() {
        let det = detector();
        let m = det
            .create_modifier(&ModifierDraft::new(ModifierKind::Member, Some(42), 0.2).with_reason("vip"), &admin())
            .unwrap();
        let g = det.create_modifier(&ModifierDraft::new(ModifierKind::Global, None, 0.01), &admin()).unwrap();
        assert_eq!(det.count_active_modifiers().unwrap(), 2);

        det.delete_modifier(m.id, &admin()).unwrap();
        assert!(matches!(det.delete_modifier(m.id, &admin()), Err(Error::NotFound { .. })));

        let added = det
            .audit()
            .query(&LogFilter { action: Some(LogAction::ModifierAdded), ..Default::default() })
            .unwrap();
        assert_eq!(added.len(), 2);
        let removed = det
            .audit()
            .query(&LogFilter { action: Some(LogAction::ModifierRemoved), ..Default::default() })
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].member_id, 42);
        assert_eq!(removed[0].details.as_ref().unwrap()["reason"], "vip");
        assert_eq!(det.modifier(g.id).unwrap().value, 0.01);
    }

    #[test]
    fn test_update_and_toggle() {
        let det = detector();
        let m = det.create_modifier(&ModifierDraft::new(ModifierKind::Event, None, 0.1), &admin()).unwrap();
        let updated = det
            .update_modifier(m.id, &ModifierDraft::new(ModifierKind::Group, Some(5), -0.3), &admin())
            .unwrap();
        assert_eq!(updated.kind, ModifierKind::Group);
        assert_eq!(updated.created_by, 1);

        let off = det.set_modifier_active(m.id, false, &admin()).unwrap();
        assert!(!off.is_active);
        assert_eq!(det.count_active_modifiers().unwrap(), 0);
        assert!(det.update_modifier(99, &ModifierDraft::new(ModifierKind::Event, None, 0.1), &admin()).is_err());
        assert!(det
            .update_modifier(m.id, &ModifierDraft::new(ModifierKind::Group, None, 0.1), &admin())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_settings_import_is_audited_with_changed_keys() {
        let det = detector();
        let changed = det.import_settings(r#"{"ratio_enforcement": "hard", "target_ratio": 0.1}"#, &admin()).unwrap();
        assert_eq!(changed, vec!["ratio_enforcement".to_string()]);
        assert_eq!(det.settings().unwrap().ratio_enforcement, EnforcementMode::Hard);

        let entries = det
            .audit()
            .query(&LogFilter { action: Some(LogAction::SettingsChanged), ..Default::default() })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details.as_ref().unwrap()["keys"], json!(["ratio_enforcement"]));

        // no-op import writes nothing
        assert!(det.import_settings("{}", &admin()).unwrap().is_empty());
        assert_eq!(
            det.audit().query(&LogFilter { action: Some(LogAction::SettingsChanged), ..Default::default() }).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_bad_import_leaves_settings_untouched() {
        let det = detector();
        assert!(det.import_settings(r#"{"target_ratio": 0.3, "bogus": 1}"#, &admin()).is_err());
        assert_eq!(det.settings().unwrap().target_ratio, 0.10);
    }

    #[test]
    fn test_export_import_reset_cycle() {
        let det = detector();
        det.import_settings(r#"{"base_probability": 0.2}"#, &admin()).unwrap();
        let exported = det.export_settings().unwrap();
        assert_eq!(exported["base_probability"], json!(0.2));

        let fresh = detector();
        assert_eq!(fresh.import_settings(&exported.to_string(), &admin()).unwrap(), vec!["base_probability"]);

        assert_eq!(det.reset_settings(&admin()).unwrap(), vec!["base_probability"]);
        assert_eq!(det.settings().unwrap().base_probability, 0.05);
    }
}
