use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::api::{FlagDecision, TrustError, VerifyOutcome};
use crate::audit::{
    AuditAction, AuditDetail, AuditEntry, RetryPolicy, SecurityEventWriter,
};
use crate::cache::{FlagCache, FlagSnapshot};
use crate::config::Config;
use crate::flag_definitions::{validate_percentage, Flag, Override, Rule, RuleKind};
use crate::flag_matching;
use crate::ids::{FlagId, OrgId, RuleId, SessionId, UserId};
use crate::overrides::OverrideManager;
use crate::session_guard::{HijackAttempt, RequestContext, SessionBinding, SessionGuard};
use crate::store::TrustStore;

/// The single entry point around both resolvers: rollout decisions and
/// session integrity verification, plus the audited administrative surface.
#[derive(Clone)]
pub struct TrustEngine {
    store: Arc<dyn TrustStore>,
    cache: FlagCache,
    guard: SessionGuard,
    overrides: OverrideManager,
    audit_retention: chrono::Duration,
}

impl TrustEngine {
    pub fn new(store: Arc<dyn TrustStore>, config: &Config) -> Self {
        let security_events = SecurityEventWriter::new(
            store.clone(),
            RetryPolicy::new(
                2,
                Duration::from_millis(config.security_audit_initial_backoff_ms),
                Some(Duration::from_millis(config.security_audit_max_backoff_ms)),
            ),
            config.security_audit_max_attempts,
        );
        TrustEngine {
            guard: SessionGuard::new(store.clone(), security_events),
            overrides: OverrideManager::new(store.clone()),
            cache: FlagCache::new(Duration::from_secs(config.flag_cache_ttl_secs)),
            store,
            audit_retention: chrono::Duration::days(config.audit_retention_days),
        }
    }

    /// Resolves a flag for one organization. Overrides are read fresh on
    /// every call (they always win); the flag and its rules may be served
    /// from the short-TTL cache. The read path is never audited. On store
    /// trouble the decision degrades to the flag default instead of
    /// failing the request.
    #[instrument(skip_all, fields(flag_key = %key, org_id = %org_id))]
    pub async fn evaluate_flag(&self, key: &str, org_id: OrgId) -> Result<FlagDecision, TrustError> {
        let snapshot = match self.cache.get(key) {
            Some(snapshot) => snapshot,
            None => self.load_snapshot(key).await?,
        };

        let live_override = match self.store.get_override(snapshot.flag.id, org_id).await {
            Ok(ov) => ov.filter(|ov| ov.is_live(Utc::now())),
            Err(crate::store::StoreError::OrgScopeViolation) => {
                return Err(TrustError::OrgScopeViolation)
            }
            Err(e) => {
                tracing::warn!(flag_key = %key, "flag evaluation degraded, serving default: {e}");
                return Ok(FlagDecision::from_default(snapshot.flag.enabled));
            }
        };

        Ok(flag_matching::resolve(
            &snapshot.flag,
            &snapshot.rules,
            live_override.as_ref(),
            org_id,
        ))
    }

    /// Verifies a request against its session binding. Binding state is
    /// always read fresh from the store, never from the cache.
    #[instrument(skip_all, fields(session_id = %session_id, org_id = %org_id))]
    pub async fn verify_request(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
        user_id: UserId,
        ctx: &RequestContext,
    ) -> Result<VerifyOutcome, TrustError> {
        self.guard.verify(session_id, org_id, user_id, ctx).await
    }

    /// Registers an unbound session at issuance; the first authenticated
    /// request pins it to its network/client context.
    pub async fn issue_session(
        &self,
        session_id: SessionId,
        org_id: OrgId,
        user_id: UserId,
    ) -> Result<(), TrustError> {
        self.store
            .create_binding(SessionBinding::unbound(session_id, org_id, user_id))
            .await?;
        Ok(())
    }

    pub async fn set_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
        enabled: bool,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: Option<UserId>,
    ) -> Result<Override, TrustError> {
        let flag = self.require_flag(flag_id).await?;
        self.overrides
            .set(&flag, org_id, enabled, reason, expires_at, actor)
            .await
    }

    pub async fn clear_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
        actor: Option<UserId>,
    ) -> Result<(), TrustError> {
        let flag = self.require_flag(flag_id).await?;
        self.overrides.clear(&flag, org_id, actor).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_rule(
        &self,
        flag_id: FlagId,
        rule_id: Option<RuleId>,
        kind: RuleKind,
        org_ids: Option<BTreeSet<OrgId>>,
        percentage: Option<f64>,
        priority: i32,
        enabled: bool,
        actor: Option<UserId>,
    ) -> Result<Rule, TrustError> {
        let percentage = percentage.unwrap_or(100.0);
        validate_percentage(percentage)?;
        let flag = self.require_flag(flag_id).await?;

        let rule = Rule {
            id: rule_id.unwrap_or_else(RuleId::new),
            flag_id,
            kind,
            org_ids: org_ids.unwrap_or_default(),
            percentage,
            priority,
            enabled,
        };
        let audit = AuditEntry::new(
            flag_id,
            AuditAction::RuleUpserted,
            None,
            actor,
            AuditDetail::RuleUpserted {
                rule_id: rule.id,
                rule_kind: rule.kind.as_str().to_string(),
                priority,
                enabled,
            },
        );

        self.store.upsert_rule(rule.clone(), audit).await?;
        // Invalidated synchronously before the write returns, so the next
        // evaluation reloads the rule set.
        self.cache.invalidate(&flag.key);
        tracing::info!(flag_key = %flag.key, rule_id = %rule.id, "rule upserted");
        Ok(rule)
    }

    /// Override/rule history for a flag, in write order.
    pub async fn audit_history(&self, flag_id: FlagId) -> Result<Vec<AuditEntry>, TrustError> {
        Ok(self.store.list_audit(flag_id).await?)
    }

    pub async fn hijack_attempts(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Vec<HijackAttempt>, TrustError> {
        Ok(self.store.list_hijack_attempts(session_id, org_id).await?)
    }

    /// Drops audit and hijack rows older than the configured retention
    /// window. Driven by the operator; nothing is deleted implicitly.
    pub async fn prune_audit(&self) -> Result<u64, TrustError> {
        let cutoff = Utc::now() - self.audit_retention;
        let pruned = self.store.prune_audit_before(cutoff).await?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned audit rows past retention");
        }
        Ok(pruned)
    }

    /// Loads the flag and its rules on a cache miss. Once the flag row is
    /// in hand the default is known, so a failing rule read degrades to a
    /// rules-free snapshot instead of failing the evaluation. Degraded
    /// snapshots are not cached; the next miss retries the full read.
    async fn load_snapshot(&self, key: &str) -> Result<Arc<FlagSnapshot>, TrustError> {
        let flag = self
            .store
            .get_flag(key)
            .await?
            .ok_or_else(|| TrustError::FlagNotFound(key.to_string()))?;
        match self.store.list_rules(flag.id).await {
            Ok(rules) => {
                let snapshot = Arc::new(FlagSnapshot { flag, rules });
                self.cache.insert(key, snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!(flag_key = %key, "rule read degraded, serving default: {e}");
                Ok(Arc::new(FlagSnapshot {
                    flag,
                    rules: Vec::new(),
                }))
            }
        }
    }

    async fn require_flag(&self, flag_id: FlagId) -> Result<Flag, TrustError> {
        self.store
            .get_flag_by_id(flag_id)
            .await?
            .ok_or_else(|| TrustError::FlagNotFound(flag_id.to_string()))
    }
}
