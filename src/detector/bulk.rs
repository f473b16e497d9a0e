//! Batch operations over many users.
//!
//! Each user is processed independently: a failure is logged and counted,
//! never propagated, and never stops the rest of the batch. At most
//! `bulk_workers` users are in flight at once.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::future::Future;

use super::Detector;
use crate::audit::{AuditEvent, LogAction};
use crate::error::{Error, Result};
use crate::logging;
use crate::types::{Actor, DetectionMethod, UserId};

/// Upper bound on users handled by one `detect_undetermined` call.
pub const UNDETERMINED_BATCH: usize = 1_000;

pub const BULK_REASON: &str = "Bulk operation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BulkReport {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Detector {
    fn ensure_bulk_enabled(&self) -> Result<usize> {
        let settings = self.settings.current()?;
        if !settings.bulk_operations_enabled {
            return Err(Error::Permission("bulk operations are disabled".into()));
        }
        Ok(settings.bulk_workers.max(1))
    }

    async fn run_bulk<F, Fut>(
        &self,
        operation: &str,
        user_ids: Vec<UserId>,
        workers: usize,
        admin: &Actor,
        task: F,
    ) -> Result<BulkReport>
    where
        F: Fn(UserId) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _scope = logging::ProfileScope::with_context("bulk", &[("operation", logging::v_str(operation))]);
        let requested = user_ids.len();
        let outcomes: Vec<(UserId, Result<()>)> = stream::iter(user_ids)
            .map(|id| {
                let fut = task(id);
                async move { (id, fut.await) }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = BulkReport { requested, ..Default::default() };
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    logging::log_bulk_item_failure(operation, id, &e.to_string());
                }
            }
        }

        self.audit.log(
            AuditEvent::new(admin.id, LogAction::BulkOperation)
                .performed_by(Some(admin))
                .details(json!({
                    "operation": operation,
                    "count": report.succeeded,
                    "failed": report.failed,
                    "admin": admin.id,
                })),
        )?;
        logging::log_bulk_summary(operation, report.requested, report.succeeded, report.failed);
        Ok(report)
    }

    /// Fresh roll for every listed user. Cooldowns do not apply.
    pub async fn bulk_reroll(&self, user_ids: &[UserId], admin: &Actor) -> Result<BulkReport> {
        let workers = self.ensure_bulk_enabled()?;
        self.run_bulk("reroll", user_ids.to_vec(), workers, admin, move |id| async move {
            let user = self.user(id)?;
            self.detect(&user, DetectionMethod::Reroll, None, Some(admin)).await.map(|_| ())
        })
        .await
    }

    pub async fn bulk_set_status(
        &self,
        user_ids: &[UserId],
        is_sensitive: bool,
        admin: &Actor,
    ) -> Result<BulkReport> {
        let workers = self.ensure_bulk_enabled()?;
        let operation = if is_sensitive { "set_sensitive" } else { "set_blind" };
        self.run_bulk(operation, user_ids.to_vec(), workers, admin, move |id| async move {
            let user = self.user(id)?;
            self.set_status(&user, is_sensitive, admin, Some(BULK_REASON)).await
        })
        .await
    }

    /// Detect every directory user that has no status yet, up to
    /// `UNDETERMINED_BATCH` per call.
    pub async fn detect_undetermined(&self, admin: &Actor) -> Result<BulkReport> {
        let workers = self.ensure_bulk_enabled()?;
        let mut pending = Vec::new();
        for id in self.directory.user_ids() {
            if pending.len() >= UNDETERMINED_BATCH {
                break;
            }
            if self.statuses.get_by_user(id)?.is_none() {
                pending.push(id);
            }
        }
        self.run_bulk("detect_undetermined", pending, workers, admin, move |id| async move {
            let user = self.user(id)?;
            self.detect(&user, DetectionMethod::Admin, None, Some(admin)).await.map(|_| ())
        })
        .await
    }
}
