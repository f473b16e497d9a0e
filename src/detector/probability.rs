use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::modifier::ModifierResolver;
use crate::ratio::RatioManager;
use crate::settings::Settings;
use crate::types::{Timestamp, UserSnapshot};

/// Externally supplied adjustment: `(user, probability) -> probability`.
pub type ProbabilityHook = Arc<dyn Fn(&UserSnapshot, f64) -> f64 + Send + Sync>;

/// How a probability was assembled, for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbabilityBreakdown {
    pub base: f64,
    pub ratio_adjustment: f64,
    pub modifier_sum: f64,
    /// After hooks, before clamping.
    pub unclamped: f64,
    pub value: f64,
}

/// Owns the ordered hook collection. Each detector has its own engine,
/// so hooks registered in one never leak into another.
#[derive(Default)]
pub struct ProbabilityEngine {
    hooks: RwLock<Vec<ProbabilityHook>>,
}

impl ProbabilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks run in registration order.
    pub fn register_hook<F>(&self, hook: F)
    where
        F: Fn(&UserSnapshot, f64) -> f64 + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.push(Arc::new(hook));
        }
    }

    pub fn clear_hooks(&self) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.clear();
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn calculate(
        &self,
        user: &UserSnapshot,
        settings: &Settings,
        ratio: &mut RatioManager<'_>,
        modifiers: &ModifierResolver,
        now: Timestamp,
    ) -> Result<ProbabilityBreakdown> {
        let base = settings.base_probability;
        let ratio_adjustment = if settings.auto_adjust { ratio.calculate_adjustment(base)? } else { 0.0 };
        let modifier_sum = modifiers.sum(user, now)?;

        // Snapshot so hook code never runs under our lock.
        let hooks: Vec<ProbabilityHook> = self.hooks.read().map(|h| h.clone()).unwrap_or_default();
        let mut p = base + ratio_adjustment + modifier_sum;
        for hook in &hooks {
            p = hook(user, p);
        }

        // max/min rather than clamp: NaN from a hook collapses to the floor.
        let value = p.max(settings.min_probability).min(settings.max_probability);
        Ok(ProbabilityBreakdown { base, ratio_adjustment, modifier_sum, unclamped: p, value })
    }
}
