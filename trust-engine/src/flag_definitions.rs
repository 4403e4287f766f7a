use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::api::TrustError;
use crate::ids::{FlagId, OrgId, RuleId};

/// A named boolean capability subject to progressive rollout. Flag
/// definitions are platform-wide; which organizations see them enabled is
/// decided by rules and overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Flag {
    pub id: FlagId,
    pub key: String,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum RuleKind {
    OrgList,
    Percentage,
    Global,
    Unknown,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::OrgList => "org_list",
            RuleKind::Percentage => "percentage",
            RuleKind::Global => "global",
            RuleKind::Unknown => "unknown",
        }
    }
}

impl From<String> for RuleKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "org_list" => RuleKind::OrgList,
            "percentage" => RuleKind::Percentage,
            "global" => RuleKind::Global,
            _ => RuleKind::Unknown,
        }
    }
}

impl From<RuleKind> for String {
    fn from(k: RuleKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prioritized rollout condition belonging to exactly one flag. Lower
/// priority values are evaluated first; ties break on ascending rule id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rule {
    pub id: RuleId,
    pub flag_id: FlagId,
    pub kind: RuleKind,
    pub org_ids: BTreeSet<OrgId>,
    pub percentage: f64,
    pub priority: i32,
    pub enabled: bool,
}

impl Rule {
    /// Percentages are validated on write, but rows that predate validation
    /// are still clamped into [0, 100] at evaluation time.
    pub fn normalized_percentage(&self) -> f64 {
        self.percentage.clamp(0.0, 100.0)
    }
}

pub fn validate_percentage(percentage: f64) -> Result<(), TrustError> {
    if !(0.0..=100.0).contains(&percentage) {
        return Err(TrustError::InvalidPercentage(percentage));
    }
    Ok(())
}

/// A per-organization manual pin that bypasses rules. At most one live
/// override exists per `(flag_id, org_id)`; expired overrides are treated
/// as absent at read time but retained for history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Override {
    pub id: uuid::Uuid,
    pub flag_id: FlagId,
    pub org_id: OrgId,
    pub enabled: bool,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Override {
    /// An override expiring exactly at `now` already counts as expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_override_without_expiry_is_live() {
        let ov = Override {
            id: uuid::Uuid::now_v7(),
            flag_id: FlagId::new(),
            org_id: OrgId::new(),
            enabled: true,
            reason: "incident mitigation".to_string(),
            expires_at: None,
        };
        assert!(ov.is_live(Utc::now()));
    }

    #[test]
    fn test_override_expiring_exactly_now_is_expired() {
        let now = Utc::now();
        let ov = Override {
            id: uuid::Uuid::now_v7(),
            flag_id: FlagId::new(),
            org_id: OrgId::new(),
            enabled: true,
            reason: "pilot".to_string(),
            expires_at: Some(now),
        };
        assert!(!ov.is_live(now));
        assert!(ov.is_live(now - Duration::milliseconds(1)));
    }

    #[test]
    fn test_percentage_validation_bounds() {
        assert!(validate_percentage(0.0).is_ok());
        assert!(validate_percentage(100.0).is_ok());
        assert!(matches!(
            validate_percentage(100.1),
            Err(TrustError::InvalidPercentage(_))
        ));
        assert!(matches!(
            validate_percentage(-0.5),
            Err(TrustError::InvalidPercentage(_))
        ));
        assert!(validate_percentage(f64::NAN).is_err());
    }

    #[test]
    fn test_rule_kind_parses_from_storage_representation() {
        assert_eq!(RuleKind::from("org_list".to_string()), RuleKind::OrgList);
        assert_eq!(RuleKind::from("percentage".to_string()), RuleKind::Percentage);
        assert_eq!(RuleKind::from("global".to_string()), RuleKind::Global);
        assert_eq!(RuleKind::from("geo_fence".to_string()), RuleKind::Unknown);
    }

    #[test]
    fn test_out_of_range_percentage_is_clamped_at_read_time() {
        let rule = Rule {
            id: RuleId::new(),
            flag_id: FlagId::new(),
            kind: RuleKind::Percentage,
            org_ids: BTreeSet::new(),
            percentage: 250.0,
            priority: 0,
            enabled: true,
        };
        assert_eq!(rule.normalized_percentage(), 100.0);
    }
}
