//! The detection service: probability assembly, the roll, the status
//! write, profile sync and the audit entry.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditEvent, AuditLog, LogAction};
use crate::directory::{ProfileSync, UserDirectory};
use crate::error::{Error, Result};
use crate::logging;
use crate::maintenance::{Maintenance, MaintenanceReport};
use crate::modifier::ModifierResolver;
use crate::ratio::{RatioManager, TrendPoint};
use crate::roller::Roller;
use crate::settings::{MemorySettingsStore, Settings, SettingsStore};
use crate::storage::{LogRepository, MemoryStore, ModifierRepository, SqliteStore, StatusRepository};
use crate::types::{
    now_ts, Actor, DetectionMethod, RatioSnapshot, Status, StatusValue, Timestamp, UserId, UserSnapshot,
};

pub mod admin;
pub mod bulk;
pub mod locks;
pub mod probability;

pub use bulk::BulkReport;
pub use locks::UserLocks;
pub use probability::{ProbabilityBreakdown, ProbabilityEngine, ProbabilityHook};

/// Storage the detector runs against.
#[derive(Clone)]
pub struct Backends {
    pub statuses: Arc<dyn StatusRepository>,
    pub modifiers: Arc<dyn ModifierRepository>,
    pub logs: Arc<dyn LogRepository>,
    pub settings: Arc<dyn SettingsStore>,
}

impl Backends {
    pub fn memory(settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            statuses: store.clone(),
            modifiers: store.clone(),
            logs: store,
            settings: Arc::new(MemorySettingsStore::new(settings)),
        }
    }

    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        Self { statuses: store.clone(), modifiers: store.clone(), logs: store.clone(), settings: store }
    }
}

/// Outcome of the advisory reroll check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RerollCheck {
    /// The reroll feature is switched off.
    Disabled,
    Allowed,
    Cooldown { remaining: u64 },
}

impl RerollCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RerollCheck::Allowed)
    }

    /// `None` when rerolls are disabled.
    pub fn seconds_remaining(&self) -> Option<u64> {
        match self {
            RerollCheck::Disabled => None,
            RerollCheck::Allowed => Some(0),
            RerollCheck::Cooldown { remaining } => Some(*remaining),
        }
    }
}

/// Membership filter over the current status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Any,
    Sensitive,
    Blind,
    Undetermined,
}

impl StatusFilter {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(StatusFilter::Any),
            "sensitive" => Ok(StatusFilter::Sensitive),
            "blind" => Ok(StatusFilter::Blind),
            "undetermined" => Ok(StatusFilter::Undetermined),
            other => Err(Error::validation(format!("unknown status filter '{}'", other))),
        }
    }

    pub fn matches(&self, status: Option<&Status>) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Sensitive => status.map_or(false, |s| s.is_sensitive),
            StatusFilter::Blind => status.map_or(false, |s| !s.is_sensitive),
            StatusFilter::Undetermined => status.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorStats {
    pub counts: RatioSnapshot,
    pub ratio: f64,
    pub target_ratio: f64,
    pub active_modifiers: usize,
}

pub struct Detector {
    statuses: Arc<dyn StatusRepository>,
    modifiers: Arc<dyn ModifierRepository>,
    settings: Arc<dyn SettingsStore>,
    directory: Arc<dyn UserDirectory>,
    audit: AuditLog,
    resolver: ModifierResolver,
    engine: ProbabilityEngine,
    roller: Roller,
    sync: ProfileSync,
    locks: UserLocks,
}

impl Detector {
    pub fn new(backends: Backends, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            audit: AuditLog::new(backends.logs, directory.clone()),
            resolver: ModifierResolver::new(backends.modifiers.clone()),
            statuses: backends.statuses,
            modifiers: backends.modifiers,
            settings: backends.settings,
            directory,
            engine: ProbabilityEngine::new(),
            roller: Roller::new(),
            sync: ProfileSync::default(),
            locks: UserLocks::new(),
        }
    }

    /// Replace the default profile sync (circuit thresholds).
    pub fn with_profile_sync(mut self, sync: ProfileSync) -> Self {
        self.sync = sync;
        self
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn resolver(&self) -> &ModifierResolver {
        &self.resolver
    }

    pub fn engine(&self) -> &ProbabilityEngine {
        &self.engine
    }

    pub fn settings(&self) -> Result<Settings> {
        self.settings.current()
    }

    pub fn status_of(&self, user_id: UserId) -> Result<Option<Status>> {
        self.statuses.get_by_user(user_id)
    }

    /// Resolve a user id through the directory.
    pub fn user(&self, user_id: UserId) -> Result<UserSnapshot> {
        self.directory.lookup(user_id).ok_or_else(|| Error::not_found("user", user_id))
    }

    pub fn register_hook<F>(&self, hook: F)
    where
        F: Fn(&UserSnapshot, f64) -> f64 + Send + Sync + 'static,
    {
        self.engine.register_hook(hook);
    }

    pub fn clear_hooks(&self) {
        self.engine.clear_hooks();
    }

    pub fn calculate_probability(&self, user: &UserSnapshot) -> Result<f64> {
        Ok(self.explain_probability(user)?.value)
    }

    pub fn explain_probability(&self, user: &UserSnapshot) -> Result<ProbabilityBreakdown> {
        let settings = self.settings.current()?;
        let mut ratio = RatioManager::new(self.statuses.as_ref(), &settings);
        self.engine.calculate(user, &settings, &mut ratio, &self.resolver, now_ts())
    }

    // =========================================================================
    // Detection
    // =========================================================================

    /// Roll for `user` and persist the outcome. Not idempotent: each call
    /// is a fresh roll unless `custom_probability` is 0 or 1.
    pub async fn detect(
        &self,
        user: &UserSnapshot,
        method: DetectionMethod,
        custom_probability: Option<f64>,
        admin: Option<&Actor>,
    ) -> Result<bool> {
        if let Some(p) = custom_probability {
            if !p.is_finite() {
                return Err(Error::validation("custom probability must be a finite number"));
            }
        }
        let _guard = self.locks.acquire(user.id).await;
        self.detect_locked(user, method, custom_probability, admin).await
    }

    async fn detect_locked(
        &self,
        user: &UserSnapshot,
        method: DetectionMethod,
        custom_probability: Option<f64>,
        admin: Option<&Actor>,
    ) -> Result<bool> {
        let settings = self.settings.current()?;
        let now = now_ts();
        let mut ratio = RatioManager::new(self.statuses.as_ref(), &settings);

        let probability = match custom_probability {
            Some(p) => p,
            None => self.engine.calculate(user, &settings, &mut ratio, &self.resolver, now)?.value,
        };
        let ratio_at_detection = ratio.current_ratio()?;
        let is_sensitive = self.roller.roll(probability);

        let old_value = self.statuses.get_by_user(user.id)?.map(|s| s.value());
        self.statuses.upsert(&Status {
            user_id: user.id,
            is_sensitive,
            detection_ts: now,
            method,
            probability_used: probability,
            detected_by: admin.map(|a| a.id),
            notes: None,
        })?;
        let ratio_after_detection = ratio.fresh_ratio()?;
        let hooks_applied = if custom_probability.is_some() { 0 } else { self.engine.hook_count() };

        // Status and audit entry are written with no await between them.
        self.audit.log(
            AuditEvent::new(user.id, LogAction::Detection)
                .values(old_value, Some(StatusValue::from_flag(is_sensitive)))
                .performed_by(admin)
                .details(json!({
                    "probability": probability,
                    "method": method.as_str(),
                    "ratio_at_detection": ratio_at_detection,
                    "ratio_after_detection": ratio_after_detection,
                    "hooks_applied": hooks_applied,
                })),
        )?;
        logging::log_detection(user.id, method.as_str(), probability, is_sensitive, admin.map(|a| a.id));

        self.notify_profile(user, is_sensitive, &settings).await;
        Ok(is_sensitive)
    }

    /// Administrative override. Idempotent in the stored state.
    pub async fn set_status(
        &self,
        user: &UserSnapshot,
        is_sensitive: bool,
        admin: &Actor,
        reason: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(user.id).await;
        let settings = self.settings.current()?;

        let old_value = self.statuses.get_by_user(user.id)?.map(|s| s.value());
        self.statuses.upsert(&Status {
            user_id: user.id,
            is_sensitive,
            detection_ts: now_ts(),
            method: DetectionMethod::Admin,
            probability_used: if is_sensitive { 1.0 } else { 0.0 },
            detected_by: Some(admin.id),
            notes: reason.map(str::to_string),
        })?;
        self.audit.log(
            AuditEvent::new(user.id, LogAction::AdminOverride)
                .values(old_value, Some(StatusValue::from_flag(is_sensitive)))
                .performed_by(Some(admin))
                .details(json!({ "reason": reason })),
        )?;
        logging::log_override(user.id, is_sensitive, admin.id, reason);

        self.notify_profile(user, is_sensitive, &settings).await;
        Ok(())
    }

    async fn notify_profile(&self, user: &UserSnapshot, is_sensitive: bool, settings: &Settings) {
        let timeout = Duration::from_millis(settings.sync_timeout_ms);
        self.sync.notify(self.directory.as_ref(), user, is_sensitive, timeout).await;
    }

    /// Runs detection for a newly registered user. Never fails: errors are
    /// logged and `None` is returned, as it is when detection is disabled.
    pub async fn on_registration(&self, user: &UserSnapshot) -> Option<bool> {
        match self.settings.current() {
            Ok(s) if !s.detection_enabled => return None,
            Ok(_) => {}
            Err(e) => {
                log_registration_failure(user.id, &e);
                return None;
            }
        }
        match self.detect(user, DetectionMethod::Registration, None, None).await {
            Ok(sensitive) => Some(sensitive),
            Err(e) => {
                log_registration_failure(user.id, &e);
                None
            }
        }
    }

    // =========================================================================
    // Reroll
    // =========================================================================

    pub fn can_reroll(&self, user_id: UserId) -> Result<RerollCheck> {
        self.can_reroll_at(user_id, now_ts())
    }

    pub fn can_reroll_at(&self, user_id: UserId, now: Timestamp) -> Result<RerollCheck> {
        let settings = self.settings.current()?;
        reroll_check(&settings, self.statuses.get_by_user(user_id)?.as_ref(), now)
    }

    /// Cooldown-checked re-detection. The check and the roll happen under
    /// the same user lock, so two concurrent rerolls cannot both pass.
    pub async fn reroll(&self, user: &UserSnapshot, performer: Option<&Actor>) -> Result<bool> {
        let _guard = self.locks.acquire(user.id).await;
        match self.can_reroll(user.id)? {
            RerollCheck::Allowed => {}
            RerollCheck::Disabled => return Err(Error::Permission("rerolls are disabled".into())),
            RerollCheck::Cooldown { remaining } => {
                return Err(Error::Permission(format!("reroll available in {} seconds", remaining)))
            }
        }
        self.detect_locked(user, DetectionMethod::Reroll, None, performer).await
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn stats(&self) -> Result<DetectorStats> {
        self.stats_at(now_ts())
    }

    pub fn stats_at(&self, now: Timestamp) -> Result<DetectorStats> {
        let settings = self.settings.current()?;
        let counts = self.statuses.counts()?;
        Ok(DetectorStats {
            counts,
            ratio: counts.ratio(),
            target_ratio: settings.target_ratio,
            active_modifiers: self.modifiers.list_active(now)?.len(),
        })
    }

    pub fn ratio_trend(&self, days: u32) -> Result<Vec<TrendPoint>> {
        let settings = self.settings.current()?;
        RatioManager::new(self.statuses.as_ref(), &settings).trend(days, now_ts())
    }

    pub fn run_maintenance(&self, now: Timestamp) -> Result<MaintenanceReport> {
        Maintenance::new(&self.resolver, &self.audit, self.settings.as_ref()).run(now)
    }

    /// Directory users whose current status passes `filter`.
    pub fn members(&self, filter: StatusFilter) -> Result<Vec<UserId>> {
        let mut out = Vec::new();
        for id in self.directory.user_ids() {
            if filter.matches(self.statuses.get_by_user(id)?.as_ref()) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

fn log_registration_failure(user_id: UserId, err: &Error) {
    logging::log(
        logging::Level::Error,
        logging::Domain::Detection,
        "registration_detection_failed",
        logging::obj(&[("user_id", json!(user_id)), ("error", logging::v_str(&err.to_string()))]),
    );
}

/// `can_reroll` without storage, for callers that already hold the row.
pub fn reroll_check(settings: &Settings, status: Option<&Status>, now: Timestamp) -> Result<RerollCheck> {
    if !settings.reroll_enabled {
        return Ok(RerollCheck::Disabled);
    }
    let Some(status) = status else {
        return Ok(RerollCheck::Allowed);
    };
    let elapsed = now.saturating_sub(status.detection_ts);
    if elapsed >= settings.reroll_cooldown_seconds {
        Ok(RerollCheck::Allowed)
    } else {
        Ok(RerollCheck::Cooldown { remaining: settings.reroll_cooldown_seconds - elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogFilter;
    use crate::directory::MemoryDirectory;
    use crate::modifier::{ModifierDraft, ModifierKind};

    fn setup(settings: Settings) -> (Detector, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::with_users([
            UserSnapshot::new(1, "admin", 4),
            UserSnapshot::new(10, "kylo", 2),
            UserSnapshot::new(11, "hux", 2).with_secondary_groups(vec![6]),
        ]));
        (Detector::new(Backends::memory(settings), directory.clone()), directory)
    }

    fn kylo() -> UserSnapshot {
        UserSnapshot::new(10, "kylo", 2)
    }

    fn status_at(ts: Timestamp) -> Status {
        Status {
            user_id: 10,
            is_sensitive: false,
            detection_ts: ts,
            method: DetectionMethod::Registration,
            probability_used: 0.05,
            detected_by: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_custom_probability_extremes_are_deterministic() {
        let (det, dir) = setup(Settings::defaults());
        assert!(det.detect(&kylo(), DetectionMethod::Api, Some(1.0), None).await.unwrap());
        assert_eq!(dir.field(10), Some(true));
        assert!(!det.detect(&kylo(), DetectionMethod::Api, Some(0.0), None).await.unwrap());
        let row = det.status_of(10).unwrap().unwrap();
        assert!(!row.is_sensitive);
        assert_eq!(row.probability_used, 0.0);
        assert_eq!(row.method, DetectionMethod::Api);
    }

    #[tokio::test]
    async fn test_detect_twice_keeps_one_row_and_logs_old_value() {
        let (det, _) = setup(Settings::defaults());
        let admin = Actor::new(1);
        det.detect(&kylo(), DetectionMethod::Admin, Some(1.0), Some(&admin)).await.unwrap();
        det.detect(&kylo(), DetectionMethod::Admin, Some(0.0), Some(&admin)).await.unwrap();

        assert_eq!(det.stats().unwrap().counts.total, 1);
        let row = det.status_of(10).unwrap().unwrap();
        assert_eq!(row.detected_by, Some(1));
        assert!(!row.is_sensitive);

        let entries = det.audit().query(&LogFilter::for_member(10)).unwrap();
        assert_eq!(entries.len(), 2);
        let latest = &entries[0];
        assert_eq!(latest.action, LogAction::Detection);
        assert_eq!(latest.old_value, Some(StatusValue::Sensitive));
        assert_eq!(latest.new_value, Some(StatusValue::Blind));
        assert_eq!(latest.performed_by, Some(1));
        assert_eq!(entries[1].old_value, None);
    }

    #[tokio::test]
    async fn test_audit_records_pre_and_post_write_ratio() {
        let (det, _) = setup(Settings::defaults());
        det.detect(&UserSnapshot::new(11, "hux", 2), DetectionMethod::Api, Some(1.0), None).await.unwrap();
        det.detect(&kylo(), DetectionMethod::Api, Some(0.0), None).await.unwrap();
        let entry = det.audit().history(10, None).unwrap().remove(0);
        let details = entry.details.unwrap();
        assert_eq!(details["ratio_at_detection"], json!(1.0));
        assert_eq!(details["ratio_after_detection"], json!(0.5));
        assert_eq!(details["method"], "api");
        assert_eq!(details["probability"], json!(0.0));
    }

    #[tokio::test]
    async fn test_sync_failure_does_not_fail_detection() {
        let (det, dir) = setup(Settings::defaults());
        dir.set_sync_failure(true);
        assert!(det.detect(&kylo(), DetectionMethod::Api, Some(1.0), None).await.unwrap());
        assert!(det.status_of(10).unwrap().unwrap().is_sensitive);
        assert_eq!(det.audit().history(10, None).unwrap().len(), 1);
        assert_eq!(dir.field(10), None);
    }

    #[tokio::test]
    async fn test_slow_sync_is_bounded() {
        let mut settings = Settings::defaults();
        settings.sync_timeout_ms = 20;
        let (det, dir) = setup(settings);
        dir.set_sync_delay(Duration::from_secs(30));
        let started = std::time::Instant::now();
        det.set_status(&kylo(), true, &Actor::new(1), None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(det.status_of(10).unwrap().unwrap().is_sensitive);
    }

    #[tokio::test]
    async fn test_cancelled_detect_still_audits_the_write() {
        let (det, dir) = setup(Settings::defaults());
        dir.set_sync_delay(Duration::from_millis(500));
        let res = tokio::time::timeout(
            Duration::from_millis(50),
            det.detect(&kylo(), DetectionMethod::Api, Some(1.0), None),
        )
        .await;
        assert!(res.is_err());
        assert!(det.status_of(10).unwrap().unwrap().is_sensitive);
        let entries = det.audit().history(10, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, LogAction::Detection);
    }

    #[tokio::test]
    async fn test_cancelled_override_still_audits_the_write() {
        let (det, dir) = setup(Settings::defaults());
        dir.set_sync_delay(Duration::from_millis(500));
        let res = tokio::time::timeout(
            Duration::from_millis(50),
            det.set_status(&kylo(), true, &Actor::new(1), Some("appeal")),
        )
        .await;
        assert!(res.is_err());
        let entries = det.audit().history(10, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, LogAction::AdminOverride);
    }

    #[tokio::test]
    async fn test_audit_counts_applied_hooks() {
        let (det, _) = setup(Settings::defaults());
        det.register_hook(|_, p| p);
        det.register_hook(|_, p| p);
        det.detect(&kylo(), DetectionMethod::Api, None, None).await.unwrap();
        det.detect(&kylo(), DetectionMethod::Api, Some(1.0), None).await.unwrap();
        let entries = det.audit().history(10, None).unwrap();
        assert_eq!(entries[0].details.as_ref().unwrap()["hooks_applied"], json!(0));
        assert_eq!(entries[1].details.as_ref().unwrap()["hooks_applied"], json!(2));
    }

    #[tokio::test]
    async fn test_set_status_is_idempotent_and_uses_sentinels() {
        let (det, _) = setup(Settings::defaults());
        let admin = Actor::new(1).with_ip("198.51.100.2");
        det.detect(&kylo(), DetectionMethod::Registration, Some(0.0), None).await.unwrap();
        for _ in 0..2 {
            det.set_status(&kylo(), true, &admin, Some("appeal")).await.unwrap();
            let row = det.status_of(10).unwrap().unwrap();
            assert!(row.is_sensitive);
            assert_eq!(row.probability_used, 1.0);
            assert_eq!(row.method, DetectionMethod::Admin);
            assert_eq!(row.notes.as_deref(), Some("appeal"));
        }
        det.set_status(&kylo(), false, &admin, None).await.unwrap();
        assert_eq!(det.status_of(10).unwrap().unwrap().probability_used, 0.0);

        let overrides = det
            .audit()
            .query(&LogFilter { action: Some(LogAction::AdminOverride), ..Default::default() })
            .unwrap();
        assert_eq!(overrides.len(), 3);
        assert_eq!(overrides[2].details, Some(json!({"reason": "appeal"})));
        assert_eq!(overrides[2].ip_address.as_deref(), Some("198.51.100.2"));
    }

    #[test]
    fn test_reroll_check_cooldown_arithmetic() {
        let mut settings = Settings::defaults();
        settings.reroll_cooldown_seconds = 3_600;
        let row = status_at(10_000);
        assert_eq!(reroll_check(&settings, None, 10_000).unwrap(), RerollCheck::Allowed);
        assert_eq!(
            reroll_check(&settings, Some(&row), 11_800).unwrap(),
            RerollCheck::Cooldown { remaining: 1_800 }
        );
        assert_eq!(reroll_check(&settings, Some(&row), 13_600).unwrap(), RerollCheck::Allowed);
        assert_eq!(reroll_check(&settings, Some(&row), 20_000).unwrap().seconds_remaining(), Some(0));

        settings.reroll_enabled = false;
        let disabled = reroll_check(&settings, Some(&row), 99_999).unwrap();
        assert_eq!(disabled, RerollCheck::Disabled);
        assert_eq!(disabled.seconds_remaining(), None);
    }

    #[tokio::test]
    async fn test_reroll_respects_cooldown() {
        let (det, _) = setup(Settings::defaults());
        assert!(det.can_reroll(10).unwrap().is_allowed());
        det.reroll(&kylo(), None).await.unwrap();
        assert!(matches!(det.reroll(&kylo(), None).await, Err(Error::Permission(_))));
        assert_eq!(det.status_of(10).unwrap().unwrap().method, DetectionMethod::Reroll);
        match det.can_reroll(10).unwrap() {
            RerollCheck::Cooldown { remaining } => assert!(remaining > 86_000),
            other => panic!("expected cooldown, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reroll_disabled_is_refused() {
        let mut settings = Settings::defaults();
        settings.reroll_enabled = false;
        let (det, _) = setup(settings);
        assert!(matches!(det.reroll(&kylo(), None).await, Err(Error::Permission(_))));
        assert!(det.status_of(10).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_respects_detection_switch() {
        let mut settings = Settings::defaults();
        settings.detection_enabled = false;
        let (det, _) = setup(settings);
        assert_eq!(det.on_registration(&kylo()).await, None);
        assert!(det.status_of(10).unwrap().is_none());

        let (det, _) = setup(Settings::defaults());
        assert!(det.on_registration(&kylo()).await.is_some());
        assert_eq!(det.status_of(10).unwrap().unwrap().method, DetectionMethod::Registration);
    }

    #[tokio::test]
    async fn test_non_finite_custom_probability_rejected() {
        let (det, _) = setup(Settings::defaults());
        let err = det.detect(&kylo(), DetectionMethod::Api, Some(f64::NAN), None).await.unwrap_err();
        assert!(err.is_validation());
        assert!(det.status_of(10).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probability_includes_group_modifiers_and_hooks() {
        let mut settings = Settings::defaults();
        settings.auto_adjust = false;
        let (det, _) = setup(settings);
        det.create_modifier(&ModifierDraft::new(ModifierKind::Group, Some(6), 0.10), &Actor::new(1))
            .unwrap();
        let hux = det.user(11).unwrap();
        assert!((det.calculate_probability(&hux).unwrap() - 0.15).abs() < 1e-12);
        assert!((det.calculate_probability(&kylo()).unwrap() - 0.05).abs() < 1e-12);

        det.register_hook(|_, p| p + 0.01);
        assert!((det.calculate_probability(&kylo()).unwrap() - 0.06).abs() < 1e-12);
        det.clear_hooks();
        assert!((det.calculate_probability(&kylo()).unwrap() - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_members_filter() {
        let (det, _) = setup(Settings::defaults());
        det.detect(&kylo(), DetectionMethod::Api, Some(1.0), None).await.unwrap();
        assert_eq!(det.members(StatusFilter::Sensitive).unwrap(), vec![10]);
        assert!(det.members(StatusFilter::Blind).unwrap().is_empty());
        assert_eq!(det.members(StatusFilter::Undetermined).unwrap(), vec![1, 11]);
        assert_eq!(det.members(StatusFilter::Any).unwrap().len(), 3);
    }

    #[test]
    fn test_status_filter_matches() {
        let row = status_at(0);
        assert!(StatusFilter::Blind.matches(Some(&row)));
        assert!(!StatusFilter::Sensitive.matches(Some(&row)));
        assert!(StatusFilter::Undetermined.matches(None));
        assert!(!StatusFilter::Undetermined.matches(Some(&row)));
        assert!(StatusFilter::parse("nope").is_err());
    }
}
