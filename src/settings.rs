//! Detection policy settings, their env loading, and the flat key/value
//! import/export document.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    None,
    Soft,
    Hard,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementMode::None => "none",
            EnforcementMode::Soft => "soft",
            EnforcementMode::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(EnforcementMode::None),
            "soft" => Ok(EnforcementMode::Soft),
            "hard" => Ok(EnforcementMode::Hard),
            other => Err(Error::validation(format!("unknown ratio enforcement '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub detection_enabled: bool,
    pub base_probability: f64,
    pub min_probability: f64,
    pub max_probability: f64,
    pub target_ratio: f64,
    pub ratio_enforcement: EnforcementMode,
    /// Number of most recent statuses the ratio is computed over; 0 = all-time.
    pub ratio_window: u32,
    pub auto_adjust: bool,
    pub admin_override_enabled: bool,
    pub reroll_enabled: bool,
    pub reroll_cooldown_seconds: u64,
    pub bulk_operations_enabled: bool,
    /// Audit log retention for the maintenance job; 0 keeps entries forever.
    pub log_retention_days: u32,
    pub sensitive_label: String,
    pub blind_label: String,
    /// Upper bound on a single profile sync call.
    pub sync_timeout_ms: u64,
    /// Concurrency cap for bulk operations.
    pub bulk_workers: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Settings {
    pub fn defaults() -> Self {
        Self {
            detection_enabled: true,
            base_probability: 0.05,
            min_probability: 0.01,
            max_probability: 0.50,
            target_ratio: 0.10,
            ratio_enforcement: EnforcementMode::Soft,
            ratio_window: 100,
            auto_adjust: true,
            admin_override_enabled: true,
            reroll_enabled: true,
            reroll_cooldown_seconds: 86_400,
            bulk_operations_enabled: true,
            log_retention_days: 0,
            sensitive_label: "Force Sensitive".to_string(),
            blind_label: "Force Blind".to_string(),
            sync_timeout_ms: 2_000,
            bulk_workers: num_cpus::get().max(1),
        }
    }

    pub fn from_env() -> Self {
        let d = Self::defaults();
        Self {
            detection_enabled: env_flag("FS_DETECTION_ENABLED", d.detection_enabled),
            base_probability: env_parse("FS_BASE_PROBABILITY", d.base_probability),
            min_probability: env_parse("FS_MIN_PROBABILITY", d.min_probability),
            max_probability: env_parse("FS_MAX_PROBABILITY", d.max_probability),
            target_ratio: env_parse("FS_TARGET_RATIO", d.target_ratio),
            ratio_enforcement: std::env::var("FS_RATIO_ENFORCEMENT")
                .ok()
                .and_then(|v| EnforcementMode::parse(&v.to_lowercase()).ok())
                .unwrap_or(d.ratio_enforcement),
            ratio_window: env_parse("FS_RATIO_WINDOW", d.ratio_window),
            auto_adjust: env_flag("FS_AUTO_ADJUST", d.auto_adjust),
            admin_override_enabled: env_flag("FS_ADMIN_OVERRIDE", d.admin_override_enabled),
            reroll_enabled: env_flag("FS_REROLL_ENABLED", d.reroll_enabled),
            reroll_cooldown_seconds: env_parse("FS_REROLL_COOLDOWN", d.reroll_cooldown_seconds),
            bulk_operations_enabled: env_flag("FS_BULK_OPERATIONS", d.bulk_operations_enabled),
            log_retention_days: env_parse("FS_LOG_RETENTION_DAYS", d.log_retention_days),
            sensitive_label: std::env::var("FS_SENSITIVE_LABEL").unwrap_or(d.sensitive_label),
            blind_label: std::env::var("FS_BLIND_LABEL").unwrap_or(d.blind_label),
            sync_timeout_ms: env_parse("FS_SYNC_TIMEOUT_MS", d.sync_timeout_ms),
            bulk_workers: env_parse("FS_BULK_WORKERS", d.bulk_workers).max(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("base_probability", self.base_probability),
            ("min_probability", self.min_probability),
            ("max_probability", self.max_probability),
            ("target_ratio", self.target_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::validation(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if self.min_probability > self.max_probability {
            return Err(Error::validation(format!(
                "min_probability {} exceeds max_probability {}",
                self.min_probability, self.max_probability
            )));
        }
        if self.bulk_workers == 0 {
            return Err(Error::validation("bulk_workers must be at least 1"));
        }
        Ok(())
    }

    pub fn label_for(&self, is_sensitive: bool) -> &str {
        if is_sensitive {
            &self.sensitive_label
        } else {
            &self.blind_label
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

// =============================================================================
// Settings store collaborator
// =============================================================================

pub trait SettingsStore: Send + Sync {
    fn current(&self) -> Result<Settings>;
    fn replace(&self, settings: Settings) -> Result<()>;
}

/// Process-local store, mainly for tests and embedding.
#[derive(Debug)]
pub struct MemorySettingsStore {
    inner: RwLock<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self { inner: RwLock::new(settings) }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn current(&self) -> Result<Settings> {
        self.inner.read().map(|s| s.clone()).map_err(|_| Error::Poisoned("settings"))
    }

    fn replace(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.inner.write().map_err(|_| Error::Poisoned("settings"))?;
        *guard = settings;
        Ok(())
    }
}

// =============================================================================
// Import / export document
// =============================================================================

/// Keys a settings document may carry and apply.
pub const SETTINGS_KEYS: [&str; 15] = [
    "detection_enabled",
    "base_probability",
    "min_probability",
    "max_probability",
    "target_ratio",
    "ratio_enforcement",
    "ratio_window",
    "auto_adjust",
    "admin_override_enabled",
    "reroll_enabled",
    "reroll_cooldown_seconds",
    "bulk_operations_enabled",
    "log_retention_days",
    "sensitive_label",
    "blind_label",
];

/// Written by export; accepted on import but never applied.
pub const METADATA_KEYS: [&str; 3] = ["exported_at", "version", "checksum"];

fn whitelisted_values(settings: &Settings) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("detection_enabled".into(), json!(settings.detection_enabled));
    map.insert("base_probability".into(), json!(settings.base_probability));
    map.insert("min_probability".into(), json!(settings.min_probability));
    map.insert("max_probability".into(), json!(settings.max_probability));
    map.insert("target_ratio".into(), json!(settings.target_ratio));
    map.insert("ratio_enforcement".into(), json!(settings.ratio_enforcement.as_str()));
    map.insert("ratio_window".into(), json!(settings.ratio_window));
    map.insert("auto_adjust".into(), json!(settings.auto_adjust));
    map.insert("admin_override_enabled".into(), json!(settings.admin_override_enabled));
    map.insert("reroll_enabled".into(), json!(settings.reroll_enabled));
    map.insert("reroll_cooldown_seconds".into(), json!(settings.reroll_cooldown_seconds));
    map.insert("bulk_operations_enabled".into(), json!(settings.bulk_operations_enabled));
    map.insert("log_retention_days".into(), json!(settings.log_retention_days));
    map.insert("sensitive_label".into(), json!(settings.sensitive_label));
    map.insert("blind_label".into(), json!(settings.blind_label));
    map
}

fn checksum(values: &Map<String, Value>) -> String {
    // serde_json maps iterate in key order, so the encoding is canonical.
    let canonical = Value::Object(values.clone()).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Flat document of the whitelisted keys plus export metadata.
pub fn export_document(settings: &Settings, exported_at: Timestamp) -> Value {
    let mut doc = whitelisted_values(settings);
    let sum = checksum(&doc);
    doc.insert("exported_at".into(), json!(exported_at));
    doc.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    doc.insert("checksum".into(), json!(sum));
    Value::Object(doc)
}

fn expect_bool(key: &str, v: &Value) -> Result<bool> {
    v.as_bool().ok_or_else(|| Error::validation(format!("{} must be a boolean", key)))
}

fn expect_f64(key: &str, v: &Value) -> Result<f64> {
    v.as_f64().ok_or_else(|| Error::validation(format!("{} must be a number", key)))
}

fn expect_u64(key: &str, v: &Value) -> Result<u64> {
    v.as_u64().ok_or_else(|| Error::validation(format!("{} must be a non-negative integer", key)))
}

fn expect_str<'a>(key: &str, v: &'a Value) -> Result<&'a str> {
    v.as_str().ok_or_else(|| Error::validation(format!("{} must be a string", key)))
}

fn apply_key(settings: &mut Settings, key: &str, v: &Value) -> Result<()> {
    match key {
        "detection_enabled" => settings.detection_enabled = expect_bool(key, v)?,
        "base_probability" => settings.base_probability = expect_f64(key, v)?,
        "min_probability" => settings.min_probability = expect_f64(key, v)?,
        "max_probability" => settings.max_probability = expect_f64(key, v)?,
        "target_ratio" => settings.target_ratio = expect_f64(key, v)?,
        "ratio_enforcement" => settings.ratio_enforcement = EnforcementMode::parse(expect_str(key, v)?)?,
        "ratio_window" => {
            settings.ratio_window = u32::try_from(expect_u64(key, v)?)
                .map_err(|_| Error::validation("ratio_window out of range"))?
        }
        "auto_adjust" => settings.auto_adjust = expect_bool(key, v)?,
        "admin_override_enabled" => settings.admin_override_enabled = expect_bool(key, v)?,
        "reroll_enabled" => settings.reroll_enabled = expect_bool(key, v)?,
        "reroll_cooldown_seconds" => settings.reroll_cooldown_seconds = expect_u64(key, v)?,
        "bulk_operations_enabled" => settings.bulk_operations_enabled = expect_bool(key, v)?,
        "log_retention_days" => {
            settings.log_retention_days = u32::try_from(expect_u64(key, v)?)
                .map_err(|_| Error::validation("log_retention_days out of range"))?
        }
        "sensitive_label" => settings.sensitive_label = expect_str(key, v)?.to_string(),
        "blind_label" => settings.blind_label = expect_str(key, v)?.to_string(),
        other => return Err(Error::validation(format!("unknown settings key '{}'", other))),
    }
    Ok(())
}

/// Parse a settings document and apply it on top of `base`.
///
/// All-or-nothing: any unknown key, mistyped value, checksum mismatch or
/// invalid resulting settings rejects the whole document. Returns the new
/// settings and the keys whose values changed.
pub fn import_document(raw: &str, base: &Settings) -> Result<(Settings, Vec<String>)> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| Error::validation(format!("settings document is not valid JSON: {}", e)))?;
    let Value::Object(doc) = parsed else {
        return Err(Error::validation("settings document must be a JSON object"));
    };

    let mut values = Map::new();
    for (key, value) in &doc {
        if METADATA_KEYS.contains(&key.as_str()) {
            continue;
        }
        if !SETTINGS_KEYS.contains(&key.as_str()) {
            return Err(Error::validation(format!("unknown settings key '{}'", key)));
        }
        values.insert(key.clone(), value.clone());
    }

    if let Some(sum) = doc.get("checksum") {
        let sum = expect_str("checksum", sum)?;
        if sum != checksum(&values) {
            return Err(Error::validation("settings checksum mismatch"));
        }
    }

    let mut next = base.clone();
    for (key, value) in &values {
        apply_key(&mut next, key, value)?;
    }
    next.validate()?;

    let changed = changed_keys(base, &next);
    Ok((next, changed))
}

/// Whitelisted keys whose values differ, in whitelist order.
pub fn changed_keys(before: &Settings, after: &Settings) -> Vec<String> {
    let (before, after) = (whitelisted_values(before), whitelisted_values(after));
    SETTINGS_KEYS
        .iter()
        .filter(|k| before.get(**k) != after.get(**k))
        .map(|k| k.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let s = Settings::defaults();
        assert!(s.validate().is_ok());
        assert_eq!(s.ratio_enforcement, EnforcementMode::Soft);
        assert_eq!(s.reroll_cooldown_seconds, 86_400);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut s = Settings::defaults();
        s.min_probability = 0.6;
        s.max_probability = 0.5;
        assert!(s.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_validate_rejects_out_of_range_probability() {
        let mut s = Settings::defaults();
        s.base_probability = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_export_then_import_is_accepted_unchanged() {
        let s = Settings::defaults();
        let doc = export_document(&s, 1_700_000_000).to_string();
        let (imported, changed) = import_document(&doc, &s).unwrap();
        assert_eq!(imported, s);
        assert!(changed.is_empty());
    }

    #[test]
    fn test_import_applies_partial_document() {
        let s = Settings::defaults();
        let (next, changed) =
            import_document(r#"{"target_ratio": 0.2, "ratio_enforcement": "hard"}"#, &s).unwrap();
        assert_eq!(next.target_ratio, 0.2);
        assert_eq!(next.ratio_enforcement, EnforcementMode::Hard);
        assert_eq!(changed, vec!["target_ratio".to_string(), "ratio_enforcement".to_string()]);
    }

    #[test]
    fn test_import_rejects_unknown_key() {
        let err = import_document(r#"{"fs_show_badge": true}"#, &Settings::defaults()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_import_rejects_malformed_json_and_non_objects() {
        assert!(import_document("{not json", &Settings::defaults()).unwrap_err().is_validation());
        assert!(import_document("[1,2]", &Settings::defaults()).unwrap_err().is_validation());
    }

    #[test]
    fn test_import_rejects_wrong_types() {
        let err = import_document(r#"{"auto_adjust": "yes"}"#, &Settings::defaults()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_import_rejects_tampered_checksum() {
        let s = Settings::defaults();
        let mut doc = export_document(&s, 0);
        doc["base_probability"] = json!(0.9);
        assert!(import_document(&doc.to_string(), &s).unwrap_err().is_validation());
    }

    #[test]
    fn test_import_rejects_resulting_invalid_settings() {
        let err = import_document(r#"{"min_probability": 0.9}"#, &Settings::defaults()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_memory_store_refuses_invalid_replace() {
        let store = MemorySettingsStore::new(Settings::defaults());
        let mut bad = Settings::defaults();
        bad.target_ratio = -0.1;
        assert!(store.replace(bad).is_err());
        assert_eq!(store.current().unwrap(), Settings::defaults());
    }
}
