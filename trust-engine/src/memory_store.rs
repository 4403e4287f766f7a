use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Mutex;

use crate::audit::AuditEntry;
use crate::flag_definitions::{Flag, Override, Rule};
use crate::ids::{FlagId, OrgId, SessionId};
use crate::session_guard::{HijackAttempt, SessionBinding};
use crate::store::{BindOutcome, StoreError, TrustStore};

#[derive(Default)]
struct Inner {
    flags: HashMap<FlagId, Flag>,
    flag_keys: HashMap<String, FlagId>,
    rules: HashMap<FlagId, Vec<Rule>>,
    overrides: HashMap<(FlagId, OrgId), Override>,
    audit: Vec<AuditEntry>,
    bindings: HashMap<SessionId, SessionBinding>,
    hijack_attempts: Vec<HijackAttempt>,
}

/// In-process store. A single mutex over all state makes every operation,
/// including the binding compare-and-set, atomic. `set_down` scripts a
/// full storage outage; `set_rule_reads_down` and `set_hijack_writes_down`
/// fail a single operation so partial-failure paths can be exercised in
/// tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    down: AtomicBool,
    rule_reads_down: AtomicBool,
    hijack_writes_down: AtomicBool,
    hijack_write_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_rule_reads_down(&self, down: bool) {
        self.rule_reads_down.store(down, Ordering::SeqCst);
    }

    pub fn set_hijack_writes_down(&self, down: bool) {
        self.hijack_writes_down.store(down, Ordering::SeqCst);
    }

    /// How many times `record_hijack_attempt` has been called, successful
    /// or not. Lets tests observe the writer's retries.
    pub fn hijack_write_calls(&self) -> u32 {
        self.hijack_write_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("scripted outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TrustStore for MemoryStore {
    async fn create_flag(&self, flag: Flag) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.flag_keys.insert(flag.key.clone(), flag.id);
        inner.flags.insert(flag.id, flag);
        Ok(())
    }

    async fn get_flag(&self, key: &str) -> Result<Option<Flag>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .flag_keys
            .get(key)
            .and_then(|id| inner.flags.get(id))
            .cloned())
    }

    async fn get_flag_by_id(&self, flag_id: FlagId) -> Result<Option<Flag>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.flags.get(&flag_id).cloned())
    }

    async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError> {
        self.check_available()?;
        if self.rule_reads_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "scripted rule read outage".to_string(),
            ));
        }
        let inner = self.inner.lock().await;
        Ok(inner.rules.get(&flag_id).cloned().unwrap_or_default())
    }

    async fn upsert_rule(&self, rule: Rule, audit: AuditEntry) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let rules = inner.rules.entry(rule.flag_id).or_default();
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        inner.audit.push(audit);
        Ok(())
    }

    async fn get_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
    ) -> Result<Option<Override>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.overrides.get(&(flag_id, org_id)).cloned())
    }

    async fn put_override(&self, ov: Override, audit: AuditEntry) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.overrides.insert((ov.flag_id, ov.org_id), ov);
        inner.audit.push(audit);
        Ok(())
    }

    async fn clear_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
        audit: AuditEntry,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.overrides.remove(&(flag_id, org_id));
        inner.audit.push(audit);
        Ok(())
    }

    async fn list_audit(&self, flag_id: FlagId) -> Result<Vec<AuditEntry>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .audit
            .iter()
            .filter(|entry| entry.flag_id == flag_id)
            .cloned()
            .collect())
    }

    async fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let before = inner.audit.len() + inner.hijack_attempts.len();
        inner.audit.retain(|entry| entry.created_at >= cutoff);
        inner
            .hijack_attempts
            .retain(|attempt| attempt.created_at >= cutoff);
        let after = inner.audit.len() + inner.hijack_attempts.len();
        Ok((before - after) as u64)
    }

    async fn create_binding(&self, binding: SessionBinding) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.bindings.insert(binding.session_id.clone(), binding);
        Ok(())
    }

    async fn get_binding(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Option<SessionBinding>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        match inner.bindings.get(session_id) {
            Some(binding) if binding.org_id != org_id => Err(StoreError::OrgScopeViolation),
            Some(binding) => Ok(Some(binding.clone())),
            None => Ok(None),
        }
    }

    async fn bind_if_unbound(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
        ip: IpAddr,
        user_agent: &str,
    ) -> Result<BindOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.bindings.get_mut(session_id) {
            None => Ok(BindOutcome::Missing),
            Some(binding) if binding.org_id != org_id => Err(StoreError::OrgScopeViolation),
            Some(binding) => {
                if binding.bound_ip.is_none() && binding.bound_user_agent.is_none() {
                    binding.bound_ip = Some(ip);
                    binding.bound_user_agent = Some(user_agent.to_string());
                    Ok(BindOutcome::Bound)
                } else {
                    Ok(BindOutcome::AlreadyBound)
                }
            }
        }
    }

    async fn invalidate_session(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.bindings.get(session_id) {
            Some(binding) if binding.org_id != org_id => Err(StoreError::OrgScopeViolation),
            Some(_) => {
                inner.bindings.remove(session_id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn record_hijack_attempt(&self, attempt: HijackAttempt) -> Result<(), StoreError> {
        self.hijack_write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.hijack_writes_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "scripted hijack write outage".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        inner.hijack_attempts.push(attempt);
        Ok(())
    }

    async fn list_hijack_attempts(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Vec<HijackAttempt>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .hijack_attempts
            .iter()
            .filter(|attempt| &attempt.session_id == session_id && attempt.org_id == org_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_if_unbound_has_a_single_winner() {
        let store = MemoryStore::new();
        let session = SessionId::from("sess_1");
        let org = OrgId::new();
        store
            .create_binding(SessionBinding::unbound(session.clone(), org, UserId::new()))
            .await
            .unwrap();

        let first = store
            .bind_if_unbound(&session, org, ip("1.1.1.1"), "Chrome")
            .await
            .unwrap();
        let second = store
            .bind_if_unbound(&session, org, ip("9.9.9.9"), "Firefox")
            .await
            .unwrap();

        assert_eq!(first, BindOutcome::Bound);
        assert_eq!(second, BindOutcome::AlreadyBound);

        let binding = store.get_binding(&session, org).await.unwrap().unwrap();
        assert_eq!(binding.bound_ip, Some(ip("1.1.1.1")));
        assert_eq!(binding.bound_user_agent.as_deref(), Some("Chrome"));
    }

    #[tokio::test]
    async fn test_binding_read_under_wrong_org_is_rejected() {
        let store = MemoryStore::new();
        let session = SessionId::from("sess_2");
        let org = OrgId::new();
        store
            .create_binding(SessionBinding::unbound(session.clone(), org, UserId::new()))
            .await
            .unwrap();

        match store.get_binding(&session, OrgId::new()).await {
            Err(StoreError::OrgScopeViolation) => (),
            other => panic!("expected OrgScopeViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalidate_under_wrong_org_is_rejected_and_keeps_binding() {
        let store = MemoryStore::new();
        let session = SessionId::from("sess_3");
        let org = OrgId::new();
        store
            .create_binding(SessionBinding::unbound(session.clone(), org, UserId::new()))
            .await
            .unwrap();

        match store.invalidate_session(&session, OrgId::new()).await {
            Err(StoreError::OrgScopeViolation) => (),
            other => panic!("expected OrgScopeViolation, got {other:?}"),
        }
        assert!(store.get_binding(&session, org).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bind_for_missing_session_reports_missing() {
        let store = MemoryStore::new();
        let outcome = store
            .bind_if_unbound(&SessionId::from("nope"), OrgId::new(), ip("1.1.1.1"), "ua")
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::Missing);
    }

    #[tokio::test]
    async fn test_scripted_outage_fails_reads() {
        let store = MemoryStore::new();
        store.set_down(true);
        assert!(matches!(
            store.get_flag("anything").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_down(false);
        assert!(store.get_flag("anything").await.unwrap().is_none());
    }
}
