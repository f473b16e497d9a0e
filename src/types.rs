use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type UserId = u64;
pub type GroupId = u64;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

pub fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Identity and group membership as supplied by the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: UserId,
    pub name: String,
    pub primary_group: GroupId,
    #[serde(default)]
    pub secondary_groups: Vec<GroupId>,
}

impl UserSnapshot {
    pub fn new(id: UserId, name: impl Into<String>, primary_group: GroupId) -> Self {
        Self { id, name: name.into(), primary_group, secondary_groups: Vec::new() }
    }

    pub fn with_secondary_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.secondary_groups = groups;
        self
    }

    /// Primary group plus every secondary group.
    pub fn in_group(&self, group: GroupId) -> bool {
        self.primary_group == group || self.secondary_groups.contains(&group)
    }
}

/// Administrator (or other caller) performing an operation. The host
/// resolves the originating IP; the core only records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub ip_address: Option<String>,
}

impl Actor {
    pub fn new(id: UserId) -> Self {
        Self { id, ip_address: None }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusValue {
    Sensitive,
    Blind,
}

impl StatusValue {
    pub fn from_flag(is_sensitive: bool) -> Self {
        if is_sensitive {
            StatusValue::Sensitive
        } else {
            StatusValue::Blind
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusValue::Sensitive => "sensitive",
            StatusValue::Blind => "blind",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sensitive" => Ok(StatusValue::Sensitive),
            "blind" => Ok(StatusValue::Blind),
            other => Err(Error::validation(format!("unknown status value '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Registration,
    Admin,
    Reroll,
    Event,
    Api,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Registration => "registration",
            DetectionMethod::Admin => "admin",
            DetectionMethod::Reroll => "reroll",
            DetectionMethod::Event => "event",
            DetectionMethod::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "registration" => Ok(DetectionMethod::Registration),
            "admin" => Ok(DetectionMethod::Admin),
            "reroll" => Ok(DetectionMethod::Reroll),
            "event" => Ok(DetectionMethod::Event),
            "api" => Ok(DetectionMethod::Api),
            other => Err(Error::validation(format!("unknown detection method '{}'", other))),
        }
    }
}

/// Current sensitivity of one user. At most one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub user_id: UserId,
    pub is_sensitive: bool,
    pub detection_ts: Timestamp,
    pub method: DetectionMethod,
    pub probability_used: f64,
    pub detected_by: Option<UserId>,
    pub notes: Option<String>,
}

impl Status {
    pub fn value(&self) -> StatusValue {
        StatusValue::from_flag(self.is_sensitive)
    }
}

/// Population counts over the Status table (or a window of it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioSnapshot {
    pub total: u64,
    pub sensitive: u64,
    pub blind: u64,
}

impl RatioSnapshot {
    pub fn new(total: u64, sensitive: u64) -> Self {
        Self { total, sensitive, blind: total.saturating_sub(sensitive) }
    }

    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sensitive as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_membership_covers_primary_and_secondary() {
        let user = UserSnapshot::new(1, "luke", 3).with_secondary_groups(vec![7, 9]);
        assert!(user.in_group(3));
        assert!(user.in_group(9));
        assert!(!user.in_group(4));
    }

    #[test]
    fn test_empty_snapshot_ratio_is_zero() {
        assert_eq!(RatioSnapshot::default().ratio(), 0.0);
        let snap = RatioSnapshot::new(10, 3);
        assert_eq!(snap.blind, 7);
        assert!((snap.ratio() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_method_parse_rejects_unknown() {
        assert_eq!(DetectionMethod::parse("reroll").unwrap(), DetectionMethod::Reroll);
        assert!(DetectionMethod::parse("magic").is_err());
        assert_eq!(StatusValue::parse("blind").unwrap(), StatusValue::Blind);
    }
}
