use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use thiserror::Error;

use crate::audit::AuditEntry;
use crate::flag_definitions::{Flag, Override, Rule};
use crate::ids::{FlagId, OrgId, SessionId};
use crate::session_guard::{HijackAttempt, SessionBinding};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("timeout error")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("pg error: {0}")]
    Database(#[from] sqlx::Error),

    /// An org-scoped read hit a row belonging to another organization.
    /// Surfaced, never silently filtered.
    #[error("row is scoped to another organization")]
    OrgScopeViolation,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of the one-time binding compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// This caller won and the binding now carries its context.
    Bound,
    /// Another request bound the session first.
    AlreadyBound,
    /// No binding row exists for the session.
    Missing,
}

/// Tenant-scoped repository over flags, rules, overrides, session bindings
/// and the audit trail. Organization context is an explicit argument on
/// every org-scoped call; implementations are incapable of issuing an
/// unscoped query on a tenant row.
///
/// Mutations that must be audited take the audit entry as an argument and
/// commit it atomically with the mutation: if the audit row cannot be
/// written, the mutation does not happen.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn create_flag(&self, flag: Flag) -> Result<(), StoreError>;
    async fn get_flag(&self, key: &str) -> Result<Option<Flag>, StoreError>;
    async fn get_flag_by_id(&self, flag_id: FlagId) -> Result<Option<Flag>, StoreError>;

    async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError>;
    async fn upsert_rule(&self, rule: Rule, audit: AuditEntry) -> Result<(), StoreError>;

    async fn get_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
    ) -> Result<Option<Override>, StoreError>;
    /// Upserts on `(flag_id, org_id)`; concurrent writers converge on the
    /// last write while each still commits its own audit entry.
    async fn put_override(&self, ov: Override, audit: AuditEntry) -> Result<(), StoreError>;
    async fn clear_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
        audit: AuditEntry,
    ) -> Result<(), StoreError>;

    async fn list_audit(&self, flag_id: FlagId) -> Result<Vec<AuditEntry>, StoreError>;
    async fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn create_binding(&self, binding: SessionBinding) -> Result<(), StoreError>;
    async fn get_binding(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Option<SessionBinding>, StoreError>;
    /// Atomic conditional store: succeeds only if both bound fields are
    /// still null. Single winner under concurrent first requests.
    async fn bind_if_unbound(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
        ip: IpAddr,
        user_agent: &str,
    ) -> Result<BindOutcome, StoreError>;
    async fn invalidate_session(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<(), StoreError>;

    async fn record_hijack_attempt(&self, attempt: HijackAttempt) -> Result<(), StoreError>;
    async fn list_hijack_attempts(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Vec<HijackAttempt>, StoreError>;
}
