//! SQLite-backed repositories and settings store.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{LogRepository, ModifierRepository, StatusRepository};
use crate::audit::{LogAction, LogEntry, LogFilter, NewLogEntry};
use crate::error::{Error, Result};
use crate::logging;
use crate::modifier::{Modifier, ModifierDraft, ModifierFilter, ModifierKind};
use crate::settings::{Settings, SettingsStore};
use crate::types::{DetectionMethod, RatioSnapshot, Status, StatusValue, Timestamp, UserId};

const SCHEMA: &str = "BEGIN;
    CREATE TABLE IF NOT EXISTS fs_status (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL UNIQUE,
        is_sensitive INTEGER NOT NULL,
        detection_ts INTEGER NOT NULL,
        method TEXT NOT NULL,
        probability_used REAL NOT NULL,
        detected_by INTEGER,
        notes TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_fs_status_detection ON fs_status (detection_ts, id);
    CREATE TABLE IF NOT EXISTS fs_modifiers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        target_id INTEGER,
        value REAL NOT NULL,
        reason TEXT,
        start_ts INTEGER,
        end_ts INTEGER,
        is_active INTEGER NOT NULL,
        created_by INTEGER NOT NULL,
        created_ts INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_fs_modifiers_active ON fs_modifiers (is_active, kind);
    CREATE TABLE IF NOT EXISTS fs_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        member_id INTEGER NOT NULL,
        action TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        performed_by INTEGER,
        ip_address TEXT,
        timestamp INTEGER NOT NULL,
        details TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_fs_logs_member ON fs_logs (member_id);
    CREATE INDEX IF NOT EXISTS idx_fs_logs_timestamp ON fs_logs (timestamp);
    CREATE INDEX IF NOT EXISTS idx_fs_logs_action ON fs_logs (action);
    CREATE INDEX IF NOT EXISTS idx_fs_logs_performer ON fs_logs (performed_by);
    CREATE TABLE IF NOT EXISTS fs_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    COMMIT;";

const TEARDOWN: &str = "BEGIN;
    DROP TABLE IF EXISTS fs_status;
    DROP TABLE IF EXISTS fs_modifiers;
    DROP TABLE IF EXISTS fs_logs;
    DROP TABLE IF EXISTS fs_settings;
    COMMIT;";

const SETTINGS_KEY: &str = "settings";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open(path)?) };
        store.install()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.install()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned("sqlite connection"))
    }

    /// Idempotent schema creation.
    pub fn install(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        logging::log(
            logging::Level::Debug,
            logging::Domain::Storage,
            "schema_installed",
            logging::obj(&[]),
        );
        Ok(())
    }

    /// Drop every table this crate owns. Status rows, modifiers, audit
    /// entries and stored settings are all lost.
    pub fn uninstall(&self) -> Result<()> {
        self.conn()?.execute_batch(TEARDOWN)?;
        logging::log(
            logging::Level::Warn,
            logging::Domain::Storage,
            "schema_removed",
            logging::obj(&[]),
        );
        Ok(())
    }
}

fn opt_i64(v: Option<u64>) -> Option<i64> {
    v.map(|x| x as i64)
}

fn opt_u64(v: Option<i64>) -> Option<u64> {
    v.map(|x| x.max(0) as u64)
}

// =============================================================================
// Status
// =============================================================================

struct RawStatus {
    user_id: i64,
    is_sensitive: bool,
    detection_ts: i64,
    method: String,
    probability_used: f64,
    detected_by: Option<i64>,
    notes: Option<String>,
}

impl RawStatus {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            is_sensitive: row.get(1)?,
            detection_ts: row.get(2)?,
            method: row.get(3)?,
            probability_used: row.get(4)?,
            detected_by: row.get(5)?,
            notes: row.get(6)?,
        })
    }

    fn into_status(self) -> Result<Status> {
        Ok(Status {
            user_id: self.user_id as u64,
            is_sensitive: self.is_sensitive,
            detection_ts: self.detection_ts.max(0) as u64,
            method: DetectionMethod::parse(&self.method)?,
            probability_used: self.probability_used,
            detected_by: opt_u64(self.detected_by),
            notes: self.notes,
        })
    }
}

fn counts_row(row: &Row<'_>) -> rusqlite::Result<RatioSnapshot> {
    let total: i64 = row.get(0)?;
    let sensitive: i64 = row.get(1)?;
    Ok(RatioSnapshot::new(total as u64, sensitive as u64))
}

impl StatusRepository for SqliteStore {
    fn get_by_user(&self, user_id: UserId) -> Result<Option<Status>> {
        let raw = self
            .conn()?
            .query_row(
                "SELECT user_id, is_sensitive, detection_ts, method, probability_used, detected_by, notes
                 FROM fs_status WHERE user_id = ?1",
                params![user_id as i64],
                RawStatus::from_row,
            )
            .optional()?;
        raw.map(RawStatus::into_status).transpose()
    }

    fn upsert(&self, status: &Status) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO fs_status
                (user_id, is_sensitive, detection_ts, method, probability_used, detected_by, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                is_sensitive = excluded.is_sensitive,
                detection_ts = excluded.detection_ts,
                method = excluded.method,
                probability_used = excluded.probability_used,
                detected_by = excluded.detected_by,
                notes = excluded.notes",
            params![
                status.user_id as i64,
                status.is_sensitive,
                status.detection_ts as i64,
                status.method.as_str(),
                status.probability_used,
                opt_i64(status.detected_by),
                status.notes,
            ],
        )?;
        Ok(())
    }

    fn counts(&self) -> Result<RatioSnapshot> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_sensitive), 0) FROM fs_status",
            [],
            counts_row,
        )?)
    }

    fn recent_counts(&self, window: u32) -> Result<RatioSnapshot> {
        if window == 0 {
            return self.counts();
        }
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_sensitive), 0) FROM (
                SELECT is_sensitive FROM fs_status
                ORDER BY detection_ts DESC, id DESC LIMIT ?1
             )",
            params![window as i64],
            counts_row,
        )?)
    }

    fn counts_until(&self, ts: Timestamp) -> Result<RatioSnapshot> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_sensitive), 0) FROM fs_status WHERE detection_ts <= ?1",
            params![ts as i64],
            counts_row,
        )?)
    }

}

// =============================================================================
// Modifiers
// =============================================================================

const MODIFIER_COLUMNS: &str =
    "id, kind, target_id, value, reason, start_ts, end_ts, is_active, created_by, created_ts";

struct RawModifier {
    id: i64,
    kind: String,
    target_id: Option<i64>,
    value: f64,
    reason: Option<String>,
    start_ts: Option<i64>,
    end_ts: Option<i64>,
    is_active: bool,
    created_by: i64,
    created_ts: i64,
}

impl RawModifier {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            target_id: row.get(2)?,
            value: row.get(3)?,
            reason: row.get(4)?,
            start_ts: row.get(5)?,
            end_ts: row.get(6)?,
            is_active: row.get(7)?,
            created_by: row.get(8)?,
            created_ts: row.get(9)?,
        })
    }

    fn into_modifier(self) -> Result<Modifier> {
        Ok(Modifier {
            id: self.id as u64,
            kind: ModifierKind::parse(&self.kind)?,
            target_id: opt_u64(self.target_id),
            value: self.value,
            reason: self.reason,
            start_ts: opt_u64(self.start_ts),
            end_ts: opt_u64(self.end_ts),
            is_active: self.is_active,
            created_by: self.created_by as u64,
            created_ts: self.created_ts.max(0) as u64,
        })
    }
}

impl SqliteStore {
    fn select_modifiers(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Modifier>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params_from_iter(args), RawModifier::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawModifier::into_modifier).collect()
    }
}

impl ModifierRepository for SqliteStore {
    fn insert(&self, draft: &ModifierDraft, created_by: UserId, created_ts: Timestamp) -> Result<Modifier> {
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO fs_modifiers
                    (kind, target_id, value, reason, start_ts, end_ts, is_active, created_by, created_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    draft.kind.as_str(),
                    opt_i64(draft.target_id),
                    draft.value,
                    draft.reason,
                    opt_i64(draft.start_ts),
                    opt_i64(draft.end_ts),
                    draft.is_active,
                    created_by as i64,
                    created_ts as i64,
                ],
            )?;
            conn.last_insert_rowid() as u64
        };
        self.get(id)?.ok_or_else(|| Error::not_found("modifier", id))
    }

    fn get(&self, id: u64) -> Result<Option<Modifier>> {
        let sql = format!("SELECT {} FROM fs_modifiers WHERE id = ?1", MODIFIER_COLUMNS);
        Ok(self.select_modifiers(&sql, vec![SqlValue::Integer(id as i64)])?.pop())
    }

    fn update(&self, m: &Modifier) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE fs_modifiers SET kind = ?2, target_id = ?3, value = ?4, reason = ?5,
                start_ts = ?6, end_ts = ?7, is_active = ?8
             WHERE id = ?1",
            params![
                m.id as i64,
                m.kind.as_str(),
                opt_i64(m.target_id),
                m.value,
                m.reason,
                opt_i64(m.start_ts),
                opt_i64(m.end_ts),
                m.is_active,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("modifier", m.id));
        }
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<bool> {
        Ok(self.conn()?.execute("DELETE FROM fs_modifiers WHERE id = ?1", params![id as i64])? > 0)
    }

    fn list_active(&self, now: Timestamp) -> Result<Vec<Modifier>> {
        let sql = format!(
            "SELECT {} FROM fs_modifiers
             WHERE is_active = 1
               AND (start_ts IS NULL OR start_ts <= ?1)
               AND (end_ts IS NULL OR end_ts >= ?1)
             ORDER BY id",
            MODIFIER_COLUMNS
        );
        self.select_modifiers(&sql, vec![SqlValue::Integer(now as i64)])
    }

    fn list(&self, filter: &ModifierFilter) -> Result<Vec<Modifier>> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(kind) = filter.kind {
            args.push(SqlValue::Text(kind.as_str().to_string()));
            clauses.push(format!("kind = ?{}", args.len()));
        }
        if let Some(active) = filter.is_active {
            args.push(SqlValue::Integer(active as i64));
            clauses.push(format!("is_active = ?{}", args.len()));
        }
        if let Some(target) = filter.target_id {
            args.push(SqlValue::Integer(target as i64));
            clauses.push(format!("target_id = ?{}", args.len()));
        }
        let mut sql = format!("SELECT {} FROM fs_modifiers", MODIFIER_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        self.select_modifiers(&sql, args)
    }

    fn deactivate_expired(&self, now: Timestamp) -> Result<usize> {
        Ok(self.conn()?.execute(
            "UPDATE fs_modifiers SET is_active = 0
             WHERE is_active = 1 AND end_ts IS NOT NULL AND end_ts < ?1",
            params![now as i64],
        )?)
    }
}

// =============================================================================
// Audit log
// =============================================================================

struct RawLog {
    id: i64,
    member_id: i64,
    action: String,
    old_value: Option<String>,
    new_value: Option<String>,
    performed_by: Option<i64>,
    ip_address: Option<String>,
    timestamp: i64,
    details: Option<String>,
}

impl RawLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            member_id: row.get(1)?,
            action: row.get(2)?,
            old_value: row.get(3)?,
            new_value: row.get(4)?,
            performed_by: row.get(5)?,
            ip_address: row.get(6)?,
            timestamp: row.get(7)?,
            details: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            id: self.id as u64,
            member_id: self.member_id as u64,
            action: LogAction::parse(&self.action)?,
            old_value: self.old_value.as_deref().map(StatusValue::parse).transpose()?,
            new_value: self.new_value.as_deref().map(StatusValue::parse).transpose()?,
            performed_by: opt_u64(self.performed_by),
            ip_address: self.ip_address,
            timestamp: self.timestamp.max(0) as u64,
            details: self.details.as_deref().map(serde_json::from_str::<serde_json::Value>).transpose()?,
        })
    }
}

impl LogRepository for SqliteStore {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let details = entry.details.as_ref().map(|d| d.to_string());
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO fs_logs
                    (member_id, action, old_value, new_value, performed_by, ip_address, timestamp, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.member_id as i64,
                    entry.action.as_str(),
                    entry.old_value.map(|v| v.as_str()),
                    entry.new_value.map(|v| v.as_str()),
                    opt_i64(entry.performed_by),
                    entry.ip_address,
                    entry.timestamp as i64,
                    details,
                ],
            )?;
            conn.last_insert_rowid() as u64
        };
        Ok(entry.into_entry(id))
    }

    fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(member) = filter.member_id {
            args.push(SqlValue::Integer(member as i64));
            clauses.push(format!("member_id = ?{}", args.len()));
        }
        if let Some(action) = filter.action {
            args.push(SqlValue::Text(action.as_str().to_string()));
            clauses.push(format!("action = ?{}", args.len()));
        }
        if let Some(performer) = filter.performed_by {
            args.push(SqlValue::Integer(performer as i64));
            clauses.push(format!("performed_by = ?{}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(SqlValue::Integer(since as i64));
            clauses.push(format!("timestamp >= ?{}", args.len()));
        }
        if let Some(until) = filter.until {
            args.push(SqlValue::Integer(until as i64));
            clauses.push(format!("timestamp <= ?{}", args.len()));
        }
        let mut sql = String::from(
            "SELECT id, member_id, action, old_value, new_value, performed_by, ip_address, timestamp, details
             FROM fs_logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(args), RawLog::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawLog::into_entry).collect()
    }

    fn prune_before(&self, cutoff: Timestamp) -> Result<usize> {
        Ok(self.conn()?.execute("DELETE FROM fs_logs WHERE timestamp < ?1", params![cutoff as i64])?)
    }
}

// =============================================================================
// Settings
// =============================================================================

impl SettingsStore for SqliteStore {
    /// Stored settings, or the environment-derived defaults when none
    /// have been saved yet.
    fn current(&self) -> Result<Settings> {
        let raw: Option<String> = self
            .conn()?
            .query_row("SELECT value FROM fs_settings WHERE key = ?1", params![SETTINGS_KEY], |row| row.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Settings::from_env()),
        }
    }

    fn replace(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let json = serde_json::to_string(&settings)?;
        self.conn()?.execute(
            "INSERT INTO fs_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SETTINGS_KEY, json],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EnforcementMode;
    use serde_json::json;

    fn status(user_id: UserId, is_sensitive: bool, ts: Timestamp) -> Status {
        Status {
            user_id,
            is_sensitive,
            detection_ts: ts,
            method: DetectionMethod::Admin,
            probability_used: 1.0,
            detected_by: Some(9),
            notes: Some("manual".into()),
        }
    }

    #[test]
    fn test_install_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        store.install().unwrap();
        store.install().unwrap();
        assert_eq!(store.counts().unwrap(), RatioSnapshot::default());
    }

    #[test]
    fn test_upsert_overwrites_in_place() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(&status(5, false, 10)).unwrap();
        store.upsert(&status(6, false, 20)).unwrap();
        store.upsert(&status(5, true, 10)).unwrap();

        let row = store.get_by_user(5).unwrap().unwrap();
        assert!(row.is_sensitive);
        assert_eq!(row.detected_by, Some(9));
        assert_eq!(row.notes.as_deref(), Some("manual"));
        assert_eq!(store.counts().unwrap(), RatioSnapshot::new(2, 1));
        assert!(store.get_by_user(77).unwrap().is_none());
    }

    #[test]
    fn test_recent_counts_orders_by_time_then_row() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(&status(1, true, 10)).unwrap();
        store.upsert(&status(2, false, 30)).unwrap();
        store.upsert(&status(3, true, 30)).unwrap();
        store.upsert(&status(4, false, 20)).unwrap();
        assert_eq!(store.recent_counts(1).unwrap(), RatioSnapshot::new(1, 1));
        assert_eq!(store.recent_counts(3).unwrap(), RatioSnapshot::new(3, 1));
        assert_eq!(store.recent_counts(0).unwrap(), RatioSnapshot::new(4, 2));
        assert_eq!(store.counts_until(20).unwrap(), RatioSnapshot::new(2, 1));
    }

    #[test]
    fn test_modifier_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let draft = ModifierDraft::new(ModifierKind::Group, Some(4), 0.2)
            .with_reason("event week")
            .with_window(Some(100), Some(200));
        let mut m = store.insert(&draft, 1, 50).unwrap();
        assert_eq!(m.id, 1);
        assert_eq!(m.created_by, 1);
        assert_eq!(store.list_active(150).unwrap().len(), 1);
        assert!(store.list_active(201).unwrap().is_empty());

        m.value = -0.1;
        store.update(&m).unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().value, -0.1);

        store.insert(&ModifierDraft::new(ModifierKind::Global, None, 0.05), 1, 60).unwrap();
        let listed = store.list(&ModifierFilter::default()).unwrap();
        assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 1]);
        let groups = store
            .list(&ModifierFilter { kind: Some(ModifierKind::Group), ..Default::default() })
            .unwrap();
        assert_eq!(groups.len(), 1);

        assert_eq!(store.deactivate_expired(300).unwrap(), 1);
        assert_eq!(store.deactivate_expired(300).unwrap(), 0);
        assert!(store.delete(1).unwrap());
        m.id = 1;
        assert!(matches!(store.update(&m), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_log_append_query_prune() {
        let store = SqliteStore::in_memory().unwrap();
        for (member, ts) in [(1u64, 100u64), (2, 200), (1, 300)] {
            store
                .append(NewLogEntry {
                    member_id: member,
                    action: LogAction::Detection,
                    old_value: None,
                    new_value: Some(StatusValue::Blind),
                    performed_by: None,
                    ip_address: None,
                    timestamp: ts,
                    details: Some(json!({"method": "registration"})),
                })
                .unwrap();
        }
        let rows = store.query(&LogFilter::for_member(1)).unwrap();
        assert_eq!(rows.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![300, 100]);
        assert_eq!(rows[0].details, Some(json!({"method": "registration"})));
        assert_eq!(rows[0].new_value, Some(StatusValue::Blind));

        assert_eq!(store.prune_before(200).unwrap(), 1);
        assert_eq!(store.query(&LogFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_settings_persist_and_uninstall_drops_everything() {
        let store = SqliteStore::in_memory().unwrap();
        let mut s = Settings::defaults();
        s.ratio_enforcement = EnforcementMode::Hard;
        store.replace(s.clone()).unwrap();
        assert_eq!(store.current().unwrap(), s);

        store.upsert(&status(1, true, 1)).unwrap();
        store.uninstall().unwrap();
        assert!(store.counts().is_err());
        store.install().unwrap();
        assert_eq!(store.counts().unwrap(), RatioSnapshot::default());
    }
}
