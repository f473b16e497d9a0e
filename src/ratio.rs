//! Population ratio tracking and the feedback adjustment applied to the
//! base probability.
//!
//! A `RatioManager` lives for one operation. Its cache is never shared
//! between callers and must be invalidated after every Status write made
//! within that operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging;
use crate::settings::{EnforcementMode, Settings};
use crate::storage::StatusRepository;
use crate::types::{RatioSnapshot, Timestamp};

/// Deviations smaller than this produce no adjustment.
pub const DEAD_ZONE: f64 = 0.05;
pub const SOFT_LIMIT: f64 = 0.25;
const MIN_TARGET: f64 = 0.01;
const SECS_PER_DAY: u64 = 86_400;
/// Longest trend series one call may request.
pub const MAX_TREND_DAYS: u32 = 366;

/// Pure controller step. `current` and `target` are ratios in [0, 1].
pub fn adjustment_for(mode: EnforcementMode, target: f64, current: f64, base: f64) -> f64 {
    if mode == EnforcementMode::None {
        return 0.0;
    }
    let deviation = target - current;
    if deviation.abs() < DEAD_ZONE {
        return 0.0;
    }
    let scale = deviation / target.max(MIN_TARGET);
    match mode {
        EnforcementMode::None => 0.0,
        EnforcementMode::Soft => (base * scale * 0.5).clamp(-SOFT_LIMIT, SOFT_LIMIT),
        EnforcementMode::Hard => {
            if current < 0.8 * target {
                base
            } else if current > 1.2 * target {
                -0.75 * base
            } else {
                base * scale
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub total: u64,
    pub sensitive: u64,
    /// Rounded to four decimals.
    pub ratio: f64,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

pub struct RatioManager<'a> {
    statuses: &'a dyn StatusRepository,
    settings: &'a Settings,
    cached: Option<RatioSnapshot>,
}

impl<'a> RatioManager<'a> {
    pub fn new(statuses: &'a dyn StatusRepository, settings: &'a Settings) -> Self {
        Self { statuses, settings, cached: None }
    }

    /// Counts over the configured window, cached for this operation.
    pub fn snapshot(&mut self) -> Result<RatioSnapshot> {
        if let Some(snap) = self.cached {
            return Ok(snap);
        }
        let snap = self.statuses.recent_counts(self.settings.ratio_window)?;
        self.cached = Some(snap);
        Ok(snap)
    }

    /// Sensitive share over the window; 0 when no statuses exist.
    pub fn current_ratio(&mut self) -> Result<f64> {
        Ok(self.snapshot()?.ratio())
    }

    /// Bypass and replace the cache.
    pub fn fresh_ratio(&mut self) -> Result<f64> {
        self.invalidate();
        self.current_ratio()
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn calculate_adjustment(&mut self, base: f64) -> Result<f64> {
        let mode = self.settings.ratio_enforcement;
        if mode == EnforcementMode::None {
            return Ok(0.0);
        }
        let current = self.current_ratio()?;
        let target = self.settings.target_ratio;
        let adjustment = adjustment_for(mode, target, current, base);
        if adjustment != 0.0 {
            logging::log_ratio_adjustment(mode.as_str(), current, target, adjustment);
        }
        Ok(adjustment)
    }

    /// Cumulative all-time counts at the end of each of the last `days`
    /// UTC days, oldest first, ending with the day containing `now`.
    pub fn trend(&self, days: u32, now: Timestamp) -> Result<Vec<TrendPoint>> {
        if days > MAX_TREND_DAYS {
            return Err(Error::validation(format!("trend is limited to {} days, got {}", MAX_TREND_DAYS, days)));
        }
        let today_start = now - now % SECS_PER_DAY;
        let mut points = Vec::with_capacity(days as usize);
        for back in (0..days as u64).rev() {
            let Some(day_start) = today_start.checked_sub(back * SECS_PER_DAY) else {
                continue;
            };
            let snap = self.statuses.counts_until(day_start + SECS_PER_DAY - 1)?;
            let date = DateTime::<Utc>::from_timestamp(day_start as i64, 0)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| day_start.to_string());
            points.push(TrendPoint {
                date,
                total: snap.total,
                sensitive: snap.sensitive,
                ratio: round4(snap.ratio()),
            });
        }
        Ok(points)
    }
}
