//! Structured application logging for the detection core.
//!
//! Every record is one JSON line carrying a run id, a monotonically
//! increasing sequence number, a level, a domain and a free-form `data`
//! object. Info and above go to `events.jsonl`, trace/debug to
//! `trace.jsonl`, both under `$LOG_DIR/<run_id>/`. Records are mirrored to
//! stderr so stdout stays clean for CLI output (exports, reports).
//!
//! This is the operator's log. The business audit trail lives in
//! [`crate::audit`] and is never written through here.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Detection, // Rolls, overrides, rerolls
    Ratio,     // Feedback controller decisions
    Modifier,  // Modifier resolution, expiry sweep
    Audit,     // Audit trail maintenance (prune, export)
    Storage,   // Repository and schema operations
    Sync,      // Profile field sync with the user directory
    Settings,  // Import, export, reset
    Bulk,      // Batch operations
    System,    // Startup, shutdown, CLI
    Profile,   // Timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Detection => "detection",
            Domain::Ratio => "ratio",
            Domain::Modifier => "modifier",
            Domain::Audit => "audit",
            Domain::Storage => "storage",
            Domain::Sync => "sync",
            Domain::Settings => "settings",
            Domain::Bulk => "bulk",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    sinks: Option<Sinks>,
}

#[derive(Debug)]
struct Sinks {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

fn open_sinks(run_id: &str) -> Option<Sinks> {
    let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
    if base == "off" {
        return None;
    }
    let mut run_dir = PathBuf::from(base);
    run_dir.push(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }

    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
            "log_dir": run_dir.to_string_lossy(),
        })
        .to_string(),
    );

    let events = File::create(run_dir.join("events.jsonl"));
    let trace = File::create(run_dir.join("trace.jsonl"));
    match (events, trace) {
        (Ok(events), Ok(trace)) => Some(Sinks {
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
        }),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("[log] failed to create log files, stderr only: {}", err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let sinks = open_sinks(&run_id);
        RunContext { run_id, sinks }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["ip_address", "authorization", "Authorization"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["user_id", "admin_id", "modifier_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(sinks) = &ctx.sinks {
        match level {
            Level::Trace | Level::Debug => write_line(&sinks.trace, &line),
            _ => write_line(&sinks.events, &line),
        }
    }
    eprintln!("{}", line);
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_detection(user_id: u64, method: &str, probability: f64, sensitive: bool, admin_id: Option<u64>) {
    log(
        Level::Info,
        Domain::Detection,
        "detect",
        obj(&[
            ("user_id", json!(user_id)),
            ("admin_id", json!(admin_id)),
            ("method", v_str(method)),
            ("probability", v_num(probability)),
            ("sensitive", json!(sensitive)),
        ]),
    );
}

pub fn log_override(user_id: u64, sensitive: bool, admin_id: u64, reason: Option<&str>) {
    log(
        Level::Info,
        Domain::Detection,
        "admin_override",
        obj(&[
            ("user_id", json!(user_id)),
            ("admin_id", json!(admin_id)),
            ("sensitive", json!(sensitive)),
            ("reason", reason.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_ratio_adjustment(mode: &str, current: f64, target: f64, adjustment: f64) {
    log(
        Level::Debug,
        Domain::Ratio,
        "adjustment",
        obj(&[
            ("mode", v_str(mode)),
            ("current", v_num(current)),
            ("target", v_num(target)),
            ("adjustment", v_num(adjustment)),
        ]),
    );
}

pub fn log_sync_failure(user_id: u64, error: &str) {
    log(
        Level::Warn,
        Domain::Sync,
        "profile_sync_failed",
        obj(&[("user_id", json!(user_id)), ("error", v_str(error))]),
    );
}

pub fn log_sweep(deactivated: usize) {
    log(
        Level::Info,
        Domain::Modifier,
        "expiry_sweep",
        obj(&[("deactivated", json!(deactivated))]),
    );
}

pub fn log_prune(days_to_keep: u32, deleted: usize) {
    log(
        Level::Info,
        Domain::Audit,
        "prune",
        obj(&[("days_to_keep", json!(days_to_keep)), ("deleted", json!(deleted))]),
    );
}

pub fn log_bulk_item_failure(operation: &str, user_id: u64, error: &str) {
    log(
        Level::Warn,
        Domain::Bulk,
        "item_failed",
        obj(&[
            ("user_id", json!(user_id)),
            ("operation", v_str(operation)),
            ("error", v_str(error)),
        ]),
    );
}

pub fn log_bulk_summary(operation: &str, requested: usize, succeeded: usize, failed: usize) {
    log(
        Level::Info,
        Domain::Bulk,
        "summary",
        obj(&[
            ("operation", v_str(operation)),
            ("requested", json!(requested)),
            ("succeeded", json!(succeeded)),
            ("failed", json!(failed)),
        ]),
    );
}

pub fn log_settings_change(admin_id: u64, source: &str, keys: &[String]) {
    log(
        Level::Info,
        Domain::Settings,
        "changed",
        obj(&[
            ("admin_id", json!(admin_id)),
            ("source", v_str(source)),
            ("keys", json!(keys)),
        ]),
    );
}

// =============================================================================
// Utility functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits a trace record with the elapsed time when dropped.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self { label, context: Map::new(), started: Instant::now() }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, context: obj(fields), started: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}
