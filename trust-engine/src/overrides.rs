use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::TrustError;
use crate::audit::{AuditAction, AuditDetail, AuditEntry};
use crate::flag_definitions::{Flag, Override};
use crate::ids::{OrgId, UserId};
use crate::store::TrustStore;

/// Creates and clears per-organization override pins. Every mutation
/// commits atomically with its audit entry; an administrative action is
/// never applied unaudited. A concurrent second write for the same
/// `(flag_id, org_id)` resolves last-writer-wins at the store, and both
/// writers still get their audit row.
#[derive(Clone)]
pub struct OverrideManager {
    store: Arc<dyn TrustStore>,
}

impl OverrideManager {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        OverrideManager { store }
    }

    pub async fn set(
        &self,
        flag: &Flag,
        org_id: OrgId,
        enabled: bool,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: Option<UserId>,
    ) -> Result<Override, TrustError> {
        validate(reason, expires_at, Utc::now())?;

        let ov = Override {
            id: Uuid::now_v7(),
            flag_id: flag.id,
            org_id,
            enabled,
            reason: reason.to_string(),
            expires_at,
        };
        let audit = AuditEntry::new(
            flag.id,
            AuditAction::OverrideSet,
            Some(org_id),
            actor,
            AuditDetail::OverrideSet {
                enabled,
                reason: reason.to_string(),
                expires_at,
            },
        );

        self.store.put_override(ov.clone(), audit).await?;
        tracing::info!(
            flag_key = %flag.key,
            org_id = %org_id,
            enabled,
            "override set"
        );
        Ok(ov)
    }

    /// Removes the live override. History stays visible through the audit
    /// trail; expired overrides are likewise retained, not deleted.
    pub async fn clear(
        &self,
        flag: &Flag,
        org_id: OrgId,
        actor: Option<UserId>,
    ) -> Result<(), TrustError> {
        let audit = AuditEntry::new(
            flag.id,
            AuditAction::OverrideCleared,
            Some(org_id),
            actor,
            AuditDetail::OverrideCleared,
        );
        self.store.clear_override(flag.id, org_id, audit).await?;
        tracing::info!(flag_key = %flag.key, org_id = %org_id, "override cleared");
        Ok(())
    }
}

fn validate(
    reason: &str,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), TrustError> {
    if reason.trim().is_empty() {
        return Err(TrustError::EmptyReason);
    }
    if let Some(expires_at) = expires_at {
        if expires_at <= now {
            return Err(TrustError::ExpiryNotInFuture);
        }
    }
    Ok(())
}
