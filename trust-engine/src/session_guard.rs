use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{GuardAction, MismatchType, TrustError, VerifyOutcome};
use crate::audit::SecurityEventWriter;
use crate::ids::{OrgId, SessionId, UserId};
use crate::store::{BindOutcome, StoreError, TrustStore};

/// The (ip, user-agent) pair a session is pinned to after first use. Bound
/// fields start null at session issuance and are set exactly once, through
/// the store's compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionBinding {
    pub session_id: SessionId,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub bound_ip: Option<IpAddr>,
    pub bound_user_agent: Option<String>,
}

impl SessionBinding {
    pub fn unbound(session_id: SessionId, org_id: OrgId, user_id: UserId) -> Self {
        SessionBinding {
            session_id,
            org_id,
            user_id,
            bound_ip: None,
            bound_user_agent: None,
        }
    }
}

/// One divergence between a request's observed context and its session
/// binding. Created once, immutable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HijackAttempt {
    pub id: Uuid,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub mismatch: MismatchType,
    pub expected_ip: IpAddr,
    pub actual_ip: IpAddr,
    pub expected_user_agent: String,
    pub actual_user_agent: String,
    pub action: GuardAction,
    pub blocked: bool,
    pub request_path: String,
    pub request_method: String,
    pub created_at: DateTime<Utc>,
}

/// The request-scoped context a session is verified against.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: IpAddr,
    pub user_agent: String,
    pub path: String,
    pub method: String,
}

/// Verifies that a request still matches the context its session was issued
/// under. Always reads binding state fresh from the store; a stale cache is
/// acceptable for rollout decisions, never for session integrity.
#[derive(Clone)]
pub struct SessionGuard {
    store: Arc<dyn TrustStore>,
    security_events: SecurityEventWriter,
}

impl SessionGuard {
    pub fn new(store: Arc<dyn TrustStore>, security_events: SecurityEventWriter) -> Self {
        SessionGuard {
            store,
            security_events,
        }
    }

    /// Per-request transition out of `Bound`: exact match allows, a
    /// user-agent-only mismatch flags (soft signal, client upgrades and
    /// proxy rewrites happen), any IP mismatch blocks and invalidates the
    /// session. The binding record itself is never changed by an outcome.
    pub async fn verify(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
        user_id: UserId,
        ctx: &RequestContext,
    ) -> Result<VerifyOutcome, TrustError> {
        let binding = match self.store.get_binding(session_id, org_id).await {
            Ok(Some(binding)) => binding,
            Ok(None) => return Err(TrustError::SessionNotFound(session_id.clone())),
            Err(StoreError::OrgScopeViolation) => return Err(TrustError::OrgScopeViolation),
            Err(e) => return Ok(self.fail_open(session_id, &e)),
        };

        let (bound_ip, bound_user_agent) = match (binding.bound_ip, binding.bound_user_agent) {
            (Some(ip), Some(user_agent)) => (ip, user_agent),
            _ => match self.bind_first_use(session_id, org_id, ctx).await? {
                FirstUse::Bound => return Ok(VerifyOutcome::allow()),
                FirstUse::FailedOpen => return Ok(VerifyOutcome::allow()),
                FirstUse::LostRace(ip, user_agent) => (ip, user_agent),
            },
        };

        let ip_matches = bound_ip == ctx.ip;
        let user_agent_matches = bound_user_agent == ctx.user_agent;
        if ip_matches && user_agent_matches {
            // Happy path is not audited.
            return Ok(VerifyOutcome::allow());
        }

        let mismatch = match (ip_matches, user_agent_matches) {
            (false, false) => MismatchType::Both,
            (false, true) => MismatchType::IpMismatch,
            _ => MismatchType::UserAgentMismatch,
        };
        let action = if ip_matches {
            GuardAction::Flag
        } else {
            GuardAction::Block
        };

        // The user-facing effect is applied before the audit write.
        if action == GuardAction::Block {
            tracing::warn!(
                session_id = %session_id,
                org_id = %org_id,
                mismatch = %mismatch,
                "blocking session on binding mismatch"
            );
            if let Err(e) = self.store.invalidate_session(session_id, org_id).await {
                tracing::error!(
                    session_id = %session_id,
                    "failed to invalidate blocked session: {e}"
                );
            }
        }

        self.security_events
            .record(HijackAttempt {
                id: Uuid::now_v7(),
                org_id,
                user_id,
                session_id: session_id.clone(),
                mismatch,
                expected_ip: bound_ip,
                actual_ip: ctx.ip,
                expected_user_agent: bound_user_agent,
                actual_user_agent: ctx.user_agent.clone(),
                action,
                blocked: action == GuardAction::Block,
                request_path: ctx.path.clone(),
                request_method: ctx.method.clone(),
                created_at: Utc::now(),
            })
            .await;

        Ok(VerifyOutcome {
            action,
            mismatch: Some(mismatch),
        })
    }

    /// First authenticated request: take the binding via compare-and-set.
    /// A losing racer must verify against the winner's values instead of
    /// re-binding, so a contending attacker cannot claim the session.
    async fn bind_first_use(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
        ctx: &RequestContext,
    ) -> Result<FirstUse, TrustError> {
        match self
            .store
            .bind_if_unbound(session_id, org_id, ctx.ip, &ctx.user_agent)
            .await
        {
            Ok(BindOutcome::Bound) => Ok(FirstUse::Bound),
            Ok(BindOutcome::Missing) => Err(TrustError::SessionNotFound(session_id.clone())),
            Ok(BindOutcome::AlreadyBound) => {
                match self.store.get_binding(session_id, org_id).await {
                    Ok(Some(SessionBinding {
                        bound_ip: Some(ip),
                        bound_user_agent: Some(user_agent),
                        ..
                    })) => Ok(FirstUse::LostRace(ip, user_agent)),
                    Ok(_) => Err(TrustError::SessionNotFound(session_id.clone())),
                    Err(StoreError::OrgScopeViolation) => Err(TrustError::OrgScopeViolation),
                    Err(e) => {
                        self.fail_open(session_id, &e);
                        Ok(FirstUse::FailedOpen)
                    }
                }
            }
            Err(StoreError::OrgScopeViolation) => Err(TrustError::OrgScopeViolation),
            Err(e) => {
                self.fail_open(session_id, &e);
                Ok(FirstUse::FailedOpen)
            }
        }
    }

    /// Availability over strictness: during a storage outage the guard
    /// allows the request rather than mass-blocking legitimate users, and
    /// pages the operator instead.
    fn fail_open(&self, session_id: &SessionId, e: &StoreError) -> VerifyOutcome {
        tracing::error!(
            session_id = %session_id,
            "session guard failing open, binding state unreachable: {e}"
        );
        VerifyOutcome::allow()
    }
}

enum FirstUse {
    Bound,
    LostRace(IpAddr, String),
    FailedOpen,
}
