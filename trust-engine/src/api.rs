use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ids::{RuleId, SessionId};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("percentage must be within [0, 100], got {0}")]
    InvalidPercentage(f64),
    #[error("override reason must not be empty")]
    EmptyReason,
    #[error("override expiry must be in the future")]
    ExpiryNotInFuture,

    #[error("unknown flag: {0}")]
    FlagNotFound(String),
    #[error("unknown session: {0}")]
    SessionNotFound(SessionId),

    #[error("row is scoped to another organization")]
    OrgScopeViolation,

    #[error("store unavailable")]
    StoreUnavailable,
    #[error("timed out while talking to the store")]
    Timeout,
}

impl From<StoreError> for TrustError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(_) => TrustError::Timeout,
            StoreError::OrgScopeViolation => TrustError::OrgScopeViolation,
            StoreError::Database(e) => {
                tracing::error!("store error: {}", e);
                TrustError::StoreUnavailable
            }
            StoreError::Unavailable(e) => {
                tracing::error!("store unavailable: {}", e);
                TrustError::StoreUnavailable
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Override,
    Rule,
    Default,
}

/// The result of resolving a flag for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlagDecision {
    pub enabled: bool,
    pub source: DecisionSource,
    pub rule_id: Option<RuleId>,
}

impl FlagDecision {
    pub fn from_default(enabled: bool) -> Self {
        FlagDecision {
            enabled,
            source: DecisionSource::Default,
            rule_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum GuardAction {
    Allow,
    Flag,
    Block,
    Unknown,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardAction::Allow => "allow",
            GuardAction::Flag => "flag",
            GuardAction::Block => "block",
            GuardAction::Unknown => "unknown",
        }
    }
}

impl From<String> for GuardAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "allow" => GuardAction::Allow,
            "flag" => GuardAction::Flag,
            "block" => GuardAction::Block,
            _ => GuardAction::Unknown,
        }
    }
}

impl From<GuardAction> for String {
    fn from(a: GuardAction) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum MismatchType {
    IpMismatch,
    UserAgentMismatch,
    Both,
    Unknown,
}

impl MismatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchType::IpMismatch => "ip_mismatch",
            MismatchType::UserAgentMismatch => "user_agent_mismatch",
            MismatchType::Both => "both",
            MismatchType::Unknown => "unknown",
        }
    }
}

impl From<String> for MismatchType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ip_mismatch" => MismatchType::IpMismatch,
            "user_agent_mismatch" => MismatchType::UserAgentMismatch,
            "both" => MismatchType::Both,
            _ => MismatchType::Unknown,
        }
    }
}

impl From<MismatchType> for String {
    fn from(m: MismatchType) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for MismatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of verifying a request against its session binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VerifyOutcome {
    pub action: GuardAction,
    pub mismatch: Option<MismatchType>,
}

impl VerifyOutcome {
    pub fn allow() -> Self {
        VerifyOutcome {
            action: GuardAction::Allow,
            mismatch: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_action_round_trips_through_strings() {
        for action in [GuardAction::Allow, GuardAction::Flag, GuardAction::Block] {
            assert_eq!(GuardAction::from(String::from(action)), action);
        }
    }

    #[test]
    fn test_unrecognized_mismatch_type_parses_to_unknown() {
        let parsed: MismatchType = serde_json::from_str("\"tls_fingerprint_mismatch\"").unwrap();
        assert_eq!(parsed, MismatchType::Unknown);
    }

    #[test]
    fn test_mismatch_type_serializes_snake_case() {
        let serialized = serde_json::to_string(&MismatchType::UserAgentMismatch).unwrap();
        assert_eq!(serialized, "\"user_agent_mismatch\"");
    }
}
