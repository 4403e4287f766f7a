use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ids::{FlagId, OrgId, RuleId, UserId};
use crate::session_guard::HijackAttempt;
use crate::store::TrustStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum AuditAction {
    OverrideSet,
    OverrideCleared,
    RuleUpserted,
    Unknown,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::OverrideSet => "override_set",
            AuditAction::OverrideCleared => "override_cleared",
            AuditAction::RuleUpserted => "rule_upserted",
            AuditAction::Unknown => "unknown",
        }
    }
}

impl From<String> for AuditAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "override_set" => AuditAction::OverrideSet,
            "override_cleared" => AuditAction::OverrideCleared,
            "rule_upserted" => AuditAction::RuleUpserted,
            _ => AuditAction::Unknown,
        }
    }
}

impl From<AuditAction> for String {
    fn from(a: AuditAction) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload persisted in the `metadata` column. One closed variant per
/// action; rows written by a newer schema revision deserialize as `Unknown`
/// instead of an open JSON map.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetail {
    OverrideSet {
        enabled: bool,
        reason: String,
        expires_at: Option<DateTime<Utc>>,
    },
    OverrideCleared,
    RuleUpserted {
        rule_id: RuleId,
        rule_kind: String,
        priority: i32,
        enabled: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Append-only record of an administrative state change. Rows are created
/// once and never mutated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub flag_id: FlagId,
    pub action: AuditAction,
    pub org_id: Option<OrgId>,
    pub user_id: Option<UserId>,
    pub detail: AuditDetail,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        flag_id: FlagId,
        action: AuditAction,
        org_id: Option<OrgId>,
        user_id: Option<UserId>,
        detail: AuditDetail,
    ) -> Self {
        AuditEntry {
            id: Uuid::now_v7(),
            flag_id,
            action,
            org_id,
            user_id,
            detail,
            created_at: Utc::now(),
        }
    }
}

/// The backoff policy used when persisting security events.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: Some(Duration::from_secs(2)),
        }
    }
}

/// Writes hijack-attempt rows after the guard's decision has been applied.
/// The write never gates the decision: failures are retried with backoff
/// and, once attempts are exhausted, escalated as an operational alert
/// rather than reversing an already-applied block.
#[derive(Clone)]
pub struct SecurityEventWriter {
    store: Arc<dyn TrustStore>,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl SecurityEventWriter {
    pub fn new(store: Arc<dyn TrustStore>, policy: RetryPolicy, max_attempts: u32) -> Self {
        SecurityEventWriter {
            store,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn record(&self, attempt: HijackAttempt) {
        let mut tries = 0;
        loop {
            match self.store.record_hijack_attempt(attempt.clone()).await {
                Ok(()) => return,
                Err(e) if tries + 1 < self.max_attempts => {
                    tracing::warn!(
                        session_id = %attempt.session_id,
                        "retrying hijack attempt write: {e}"
                    );
                    tokio::time::sleep(self.policy.time_until_next_retry(tries)).await;
                    tries += 1;
                }
                Err(e) => {
                    // Operator alert: the decision stands but its security
                    // event could not be persisted.
                    tracing::error!(
                        session_id = %attempt.session_id,
                        mismatch = %attempt.mismatch,
                        action = %attempt.action,
                        "giving up on hijack attempt write after {} attempts: {e}",
                        self.max_attempts
                    );
                    return;
                }
            }
        }
    }
}
