//! Probabilistic sensitivity assignment.
//!
//! A [`Detector`] rolls a binary trait for users with a probability built
//! from a base rate, a population ratio controller, scoped modifiers and
//! registered hooks. Every assignment is stored as one current status per
//! user and recorded in an append-only audit log.

pub mod audit;
pub mod detector;
pub mod directory;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod modifier;
pub mod ratio;
pub mod roller;
pub mod settings;
pub mod storage;
pub mod types;

pub use audit::{AuditEvent, AuditLog, ExportFormat, LogAction, LogEntry, LogFilter};
pub use detector::{Backends, BulkReport, Detector, DetectorStats, RerollCheck, StatusFilter};
pub use directory::{MemoryDirectory, ProfileSync, UserDirectory};
pub use error::{Error, Result};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use modifier::{Modifier, ModifierDraft, ModifierFilter, ModifierKind, ModifierResolver};
pub use ratio::RatioManager;
pub use roller::Roller;
pub use settings::{EnforcementMode, Settings, SettingsStore};
pub use storage::{MemoryStore, SqliteStore};
pub use types::{Actor, DetectionMethod, Status, StatusValue, UserId, UserSnapshot};
