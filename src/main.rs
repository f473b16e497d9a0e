use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use sensitivity::audit::{ExportFormat, LogAction, LogFilter};
use sensitivity::logging::{self, obj, v_str};
use sensitivity::types::now_ts;
use sensitivity::{
    Actor, Backends, DetectionMethod, Detector, MemoryDirectory, ModifierDraft, ModifierFilter, ModifierKind,
    SqliteStore, UserDirectory, UserSnapshot,
};

const USAGE: &str = "usage: sensitivity [--db PATH] [--users FILE] [--admin ID] [--ip ADDR] <command> [args]

commands:
  detect <user> [--probability P] [--method M]
  override <user> sensitive|blind [--reason TEXT]
  reroll <user>
  can-reroll <user>
  bulk-reroll <user>...
  bulk-set sensitive|blind <user>...
  detect-undetermined
  probability <user>
  history <user> [--limit N]
  stats
  trend [DAYS]
  modifier add <member|group|global|event> --value V [--target ID] [--reason TEXT] [--start TS] [--end TS]
  modifier list [--type T] [--active true|false]
  modifier toggle <id> on|off
  modifier delete <id>
  sweep
  prune <days>
  maintenance
  export-logs csv|json [--member ID] [--action A] [--since TS] [--until TS] [--limit N]
  export-settings
  import-settings <file>
  reset-settings
  install
  uninstall

user flags (for users absent from --users): --name NAME --group ID --groups ID,ID";

/// Flags that take a value; everything else is positional.
const VALUE_FLAGS: &[&str] = &[
    "db", "users", "admin", "ip", "probability", "method", "reason", "limit", "value", "target", "start", "end",
    "type", "active", "member", "action", "since", "until", "name", "group", "groups",
];

struct Args {
    positional: Vec<String>,
    flags: HashMap<String, String>,
}

impl Args {
    fn parse(raw: impl Iterator<Item = String>) -> Result<Self> {
        let mut positional = Vec::new();
        let mut flags = HashMap::new();
        let mut raw = raw;
        while let Some(arg) = raw.next() {
            match arg.strip_prefix("--") {
                Some(name) if VALUE_FLAGS.contains(&name) => {
                    let value = raw.next().ok_or_else(|| anyhow!("--{} needs a value", name))?;
                    flags.insert(name.to_string(), value);
                }
                Some(name) => bail!("unknown flag --{}\n\n{}", name, USAGE),
                None => positional.push(arg),
            }
        }
        Ok(Self { positional, flags })
    }

    fn pos(&self, idx: usize, what: &str) -> Result<&str> {
        self.positional
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing {}\n\n{}", what, USAGE))
    }

    fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.flag(name) {
            Some(raw) => raw.parse().map(Some).map_err(|e| anyhow!("--{}: {}", name, e)),
            None => Ok(None),
        }
    }
}

fn parse_id(raw: &str) -> Result<u64> {
    raw.parse().with_context(|| format!("invalid id '{}'", raw))
}

fn parse_flag_value(raw: &str) -> Result<bool> {
    match raw {
        "sensitive" | "on" | "true" => Ok(true),
        "blind" | "off" | "false" => Ok(false),
        other => bail!("expected sensitive|blind (or on|off), got '{}'", other),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_directory(args: &Args) -> Result<MemoryDirectory> {
    let Some(path) = args.flag("users") else {
        return Ok(MemoryDirectory::new());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let users: Vec<UserSnapshot> = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;
    Ok(MemoryDirectory::with_users(users))
}

/// Directory entry, or one assembled from the user flags.
fn resolve_user(directory: &MemoryDirectory, args: &Args, raw_id: &str) -> Result<UserSnapshot> {
    let id = parse_id(raw_id)?;
    if let Some(user) = directory.lookup(id) {
        return Ok(user);
    }
    let groups = match args.flag("groups") {
        Some(list) => list.split(',').filter(|s| !s.is_empty()).map(parse_id).collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let user = UserSnapshot::new(
        id,
        args.flag("name").map(str::to_string).unwrap_or_else(|| format!("user-{}", id)),
        args.parsed("group")?.unwrap_or(0),
    )
    .with_secondary_groups(groups);
    directory.add(user.clone());
    Ok(user)
}

fn actor(args: &Args) -> Result<Actor> {
    let id = match args.flag("admin") {
        Some(raw) => parse_id(raw)?,
        None => std::env::var("FS_ADMIN_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
    };
    let actor = Actor::new(id);
    Ok(match args.flag("ip") {
        Some(ip) => actor.with_ip(ip),
        None => actor,
    })
}

fn log_filter(args: &Args) -> Result<LogFilter> {
    Ok(LogFilter {
        member_id: args.flag("member").map(parse_id).transpose()?,
        action: args.flag("action").map(LogAction::parse).transpose()?,
        performed_by: None,
        since: args.parsed("since")?,
        until: args.parsed("until")?,
        limit: args.parsed("limit")?,
    })
}

fn modifier_command(detector: &Detector, args: &Args, admin: &Actor) -> Result<()> {
    match args.pos(1, "modifier subcommand")? {
        "add" => {
            let kind = ModifierKind::parse(args.pos(2, "modifier type")?)?;
            let value = args.parsed::<f64>("value")?.ok_or_else(|| anyhow!("--value is required"))?;
            let mut draft = ModifierDraft::new(kind, args.parsed("target")?, value)
                .with_window(args.parsed("start")?, args.parsed("end")?);
            if let Some(reason) = args.flag("reason") {
                draft = draft.with_reason(reason);
            }
            print_json(&detector.create_modifier(&draft, admin)?)
        }
        "list" => {
            let filter = ModifierFilter {
                kind: args.flag("type").map(ModifierKind::parse).transpose()?,
                is_active: args.parsed("active")?,
                target_id: args.parsed("target")?,
                limit: args.parsed("limit")?,
            };
            print_json(&detector.list_modifiers(&filter)?)
        }
        "toggle" => {
            let id = parse_id(args.pos(2, "modifier id")?)?;
            let active = parse_flag_value(args.pos(3, "on|off")?)?;
            print_json(&detector.set_modifier_active(id, active, admin)?)
        }
        "delete" => {
            let id = parse_id(args.pos(2, "modifier id")?)?;
            detector.delete_modifier(id, admin)?;
            print_json(&json!({ "deleted": id }))
        }
        other => bail!("unknown modifier subcommand '{}'\n\n{}", other, USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    let command = args.pos(0, "command")?.to_string();

    let db_path = args
        .flag("db")
        .map(str::to_string)
        .or_else(|| std::env::var("FS_SQLITE_PATH").ok())
        .unwrap_or_else(|| "sensitivity.sqlite".to_string());
    let store = Arc::new(SqliteStore::open(&db_path).with_context(|| format!("opening {}", db_path))?);

    logging::log(
        logging::Level::Debug,
        logging::Domain::System,
        "cli_start",
        obj(&[("command", v_str(&command)), ("db", v_str(&db_path))]),
    );

    match command.as_str() {
        "install" => {
            store.install()?;
            return print_json(&json!({ "installed": db_path }));
        }
        "uninstall" => {
            store.uninstall()?;
            return print_json(&json!({ "uninstalled": db_path }));
        }
        _ => {}
    }

    let directory = Arc::new(load_directory(&args)?);
    let detector = Detector::new(Backends::sqlite(store.clone()), directory.clone());
    let admin = actor(&args)?;

    match command.as_str() {
        "detect" => {
            let user = resolve_user(&directory, &args, args.pos(1, "user id")?)?;
            let method = match args.flag("method") {
                Some(m) => DetectionMethod::parse(m)?,
                None => DetectionMethod::Admin,
            };
            let sensitive = detector.detect(&user, method, args.parsed("probability")?, Some(&admin)).await?;
            let label = detector.settings()?.label_for(sensitive).to_string();
            print_json(&json!({ "user_id": user.id, "sensitive": sensitive, "label": label }))
        }
        "override" => {
            if !detector.settings()?.admin_override_enabled {
                bail!("administrative overrides are disabled");
            }
            let user = resolve_user(&directory, &args, args.pos(1, "user id")?)?;
            let sensitive = parse_flag_value(args.pos(2, "sensitive|blind")?)?;
            detector.set_status(&user, sensitive, &admin, args.flag("reason")).await?;
            print_json(&detector.status_of(user.id)?)
        }
        "reroll" => {
            let user = resolve_user(&directory, &args, args.pos(1, "user id")?)?;
            let sensitive = detector.reroll(&user, Some(&admin)).await?;
            print_json(&json!({ "user_id": user.id, "sensitive": sensitive }))
        }
        "can-reroll" => {
            let id = parse_id(args.pos(1, "user id")?)?;
            print_json(&detector.can_reroll(id)?)
        }
        "bulk-reroll" => {
            let ids = args.positional[1..].iter().map(|s| parse_id(s)).collect::<Result<Vec<_>>>()?;
            for id in &ids {
                resolve_user(&directory, &args, &id.to_string())?;
            }
            print_json(&detector.bulk_reroll(&ids, &admin).await?)
        }
        "bulk-set" => {
            let sensitive = parse_flag_value(args.pos(1, "sensitive|blind")?)?;
            let ids = args.positional[2..].iter().map(|s| parse_id(s)).collect::<Result<Vec<_>>>()?;
            for id in &ids {
                resolve_user(&directory, &args, &id.to_string())?;
            }
            print_json(&detector.bulk_set_status(&ids, sensitive, &admin).await?)
        }
        "detect-undetermined" => print_json(&detector.detect_undetermined(&admin).await?),
        "probability" => {
            let user = resolve_user(&directory, &args, args.pos(1, "user id")?)?;
            print_json(&detector.explain_probability(&user)?)
        }
        "history" => {
            let id = parse_id(args.pos(1, "user id")?)?;
            print_json(&detector.audit().history(id, args.parsed("limit")?)?)
        }
        "stats" => print_json(&detector.stats()?),
        "trend" => {
            let days = match args.positional.get(1) {
                Some(raw) => raw.parse().with_context(|| format!("invalid day count '{}'", raw))?,
                None => 30,
            };
            print_json(&detector.ratio_trend(days)?)
        }
        "modifier" => modifier_command(&detector, &args, &admin),
        "sweep" => {
            let expired = detector.resolver().sweep_expired(now_ts())?;
            print_json(&json!({ "modifiers_expired": expired }))
        }
        "prune" => {
            let days: u32 = args.pos(1, "days to keep")?.parse().context("invalid day count")?;
            let deleted = detector.audit().prune(days)?;
            print_json(&json!({ "deleted": deleted }))
        }
        "maintenance" => print_json(&detector.run_maintenance(now_ts())?),
        "export-logs" => {
            let format = ExportFormat::parse(args.pos(1, "csv|json")?)?;
            print!("{}", detector.audit().export(&log_filter(&args)?, format)?);
            Ok(())
        }
        "export-settings" => print_json(&detector.export_settings()?),
        "import-settings" => {
            let path = args.pos(1, "settings file")?;
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            print_json(&json!({ "changed": detector.import_settings(&raw, &admin)? }))
        }
        "reset-settings" => print_json(&json!({ "changed": detector.reset_settings(&admin)? })),
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}
