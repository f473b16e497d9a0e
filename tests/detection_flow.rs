//! End-to-end flows against the in-memory backends.

use std::sync::Arc;

use sensitivity::audit::{LogAction, LogFilter};
use sensitivity::modifier::{ModifierDraft, ModifierKind};
use sensitivity::settings::EnforcementMode;
use sensitivity::{
    Actor, Backends, DetectionMethod, Detector, MemoryDirectory, RerollCheck, Settings, StatusFilter, StatusValue,
    UserSnapshot,
};

fn population(n: u64) -> Arc<MemoryDirectory> {
    Arc::new(MemoryDirectory::with_users(
        (1..=n).map(|id| UserSnapshot::new(id, format!("member-{}", id), 2 + id % 3)),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_detects_for_one_user_are_serialized() {
    let detector = Arc::new(Detector::new(Backends::memory(Settings::defaults()), population(3)));
    let user = detector.user(2).unwrap();

    let mut tasks = Vec::new();
    for i in 0..40 {
        let (detector, user) = (detector.clone(), user.clone());
        let p = if i % 2 == 0 { 1.0 } else { 0.0 };
        tasks.push(tokio::spawn(async move {
            detector.detect(&user, DetectionMethod::Api, Some(p), None).await.unwrap()
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(detector.stats().unwrap().counts.total, 1);
    let mut entries = detector.audit().query(&LogFilter::for_member(2)).unwrap();
    assert_eq!(entries.len(), 40);

    // Each write saw the value left by the one before it.
    entries.sort_by_key(|e| e.id);
    assert_eq!(entries[0].old_value, None);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].old_value, pair[0].new_value);
    }
    let last = entries.last().unwrap().new_value;
    assert_eq!(detector.status_of(2).unwrap().map(|s| s.value()), last);
}

#[tokio::test]
async fn registration_then_override_then_reroll_lifecycle() {
    let mut settings = Settings::defaults();
    settings.reroll_cooldown_seconds = 0;
    let detector = Detector::new(Backends::memory(settings), population(5));
    let admin = Actor::new(99).with_ip("203.0.113.9");
    let user = detector.user(3).unwrap();

    assert!(detector.on_registration(&user).await.is_some());
    assert_eq!(detector.status_of(3).unwrap().unwrap().method, DetectionMethod::Registration);

    detector.set_status(&user, true, &admin, Some("lore")).await.unwrap();
    assert!(detector.status_of(3).unwrap().unwrap().is_sensitive);

    // zero cooldown means a reroll is always available
    assert_eq!(detector.can_reroll(3).unwrap(), RerollCheck::Allowed);
    detector.reroll(&user, Some(&admin)).await.unwrap();
    assert_eq!(detector.status_of(3).unwrap().unwrap().method, DetectionMethod::Reroll);

    let history = detector.audit().history(3, None).unwrap();
    let actions: Vec<LogAction> = history.iter().map(|e| e.action).collect();
    assert_eq!(actions.len(), 3);
    assert!(actions.contains(&LogAction::AdminOverride));
    let override_entry = history.iter().find(|e| e.action == LogAction::AdminOverride).unwrap();
    assert_eq!(override_entry.new_value, Some(StatusValue::Sensitive));
    assert_eq!(override_entry.ip_address.as_deref(), Some("203.0.113.9"));
}

#[tokio::test]
async fn ratio_controller_raises_probability_when_population_is_short() {
    let mut settings = Settings::defaults();
    settings.ratio_enforcement = EnforcementMode::Hard;
    let detector = Detector::new(Backends::memory(settings), population(20));
    let admin = Actor::new(1);

    // 20 blind members: ratio 0 < 0.8 * target, hard mode doubles the base
    detector.bulk_set_status(&(1..=20).collect::<Vec<_>>(), false, &admin).await.unwrap();
    let user = detector.user(1).unwrap();
    let breakdown = detector.explain_probability(&user).unwrap();
    assert_eq!(breakdown.ratio_adjustment, breakdown.base);
    assert!((breakdown.value - 0.10).abs() < 1e-12);
}

#[tokio::test]
async fn modifiers_flow_into_detection_and_expire() {
    let mut settings = Settings::defaults();
    settings.auto_adjust = false;
    let detector = Detector::new(Backends::memory(settings), population(4));
    let admin = Actor::new(1);

    let boost = ModifierDraft::new(ModifierKind::Member, Some(4), 1.0).with_window(None, Some(1));
    detector.create_modifier(&boost, &admin).unwrap();
    // the window closed long ago, so nothing applies
    let user = detector.user(4).unwrap();
    assert!((detector.calculate_probability(&user).unwrap() - 0.05).abs() < 1e-12);

    let report = detector.run_maintenance(sensitivity::types::now_ts()).unwrap();
    assert_eq!(report.modifiers_expired, 1);
    assert_eq!(report.log_entries_pruned, None);

    detector
        .create_modifier(&ModifierDraft::new(ModifierKind::Member, Some(4), 1.0), &admin)
        .unwrap();
    assert_eq!(detector.calculate_probability(&user).unwrap(), 0.50);
}

#[tokio::test]
async fn bulk_and_filters_cover_the_population() {
    let detector = Detector::new(Backends::memory(Settings::defaults()), population(12));
    let admin = Actor::new(1);
    detector.bulk_set_status(&[1, 2, 3], true, &admin).await.unwrap();
    let report = detector.detect_undetermined(&admin).await.unwrap();
    assert_eq!(report.requested, 9);
    assert_eq!(report.failed, 0);

    let sensitive = detector.members(StatusFilter::Sensitive).unwrap();
    let blind = detector.members(StatusFilter::Blind).unwrap();
    assert_eq!(sensitive.len() + blind.len(), 12);
    assert!(detector.members(StatusFilter::Undetermined).unwrap().is_empty());

    let stats = detector.stats().unwrap();
    assert_eq!(stats.counts.total, 12);
    assert_eq!(stats.counts.sensitive as usize, sensitive.len());
    assert_eq!(stats.target_ratio, 0.10);

    let bulk_entries = detector
        .audit()
        .query(&LogFilter { action: Some(LogAction::BulkOperation), ..Default::default() })
        .unwrap();
    assert_eq!(bulk_entries.len(), 2);
}
