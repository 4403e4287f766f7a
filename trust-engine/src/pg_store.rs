use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditDetail, AuditEntry};
use crate::config::Config;
use crate::flag_definitions::{Flag, Override, Rule, RuleKind};
use crate::ids::{FlagId, OrgId, RuleId, SessionId, UserId};
use crate::session_guard::{HijackAttempt, SessionBinding};
use crate::store::{BindOutcome, StoreError, TrustStore};

// Mirrors the persisted layout the rest of the platform reads. Column names
// are the compatibility contract.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS flags (
        id UUID PRIMARY KEY,
        key TEXT UNIQUE NOT NULL,
        name TEXT NOT NULL,
        enabled BOOLEAN NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS flag_rules (
        id UUID PRIMARY KEY,
        flag_id UUID NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
        type TEXT NOT NULL,
        organization_ids JSONB NOT NULL,
        percentage DOUBLE PRECISION NOT NULL,
        priority INTEGER NOT NULL,
        enabled BOOLEAN NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS flag_overrides (
        id UUID PRIMARY KEY,
        flag_id UUID NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
        organization_id UUID NOT NULL,
        enabled BOOLEAN NOT NULL,
        reason TEXT NOT NULL,
        expires_at TIMESTAMPTZ,
        UNIQUE (flag_id, organization_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS flag_audit_logs (
        id UUID PRIMARY KEY,
        flag_id UUID NOT NULL,
        action TEXT NOT NULL,
        organization_id UUID,
        user_id UUID,
        metadata JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS flag_audit_logs_flag_created
        ON flag_audit_logs (flag_id, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        organization_id UUID NOT NULL,
        user_id UUID NOT NULL,
        ip_address TEXT,
        user_agent TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS session_hijacking_attempts (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        user_id UUID NOT NULL,
        session_id TEXT NOT NULL,
        mismatch_type TEXT NOT NULL,
        expected_ip TEXT NOT NULL,
        actual_ip TEXT NOT NULL,
        expected_user_agent TEXT NOT NULL,
        actual_user_agent TEXT NOT NULL,
        action TEXT NOT NULL,
        blocked BOOLEAN NOT NULL,
        request_path TEXT NOT NULL,
        request_method TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS session_hijacking_attempts_session
        ON session_hijacking_attempts (session_id, created_at)"#,
];

pub struct PgStore {
    pool: sqlx::PgPool,
    timeout: Duration,
}

impl PgStore {
    pub async fn new(config: &Config) -> Result<PgStore, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .connect(&config.database_url)
            .await?;

        Ok(PgStore {
            pool,
            timeout: Duration::from_millis(config.store_timeout_ms),
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Every store call is bounded by the configured timeout; the resolvers
    /// translate an elapsed timeout into their fail-open behavior.
    async fn run<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        Ok(timeout(self.timeout, fut).await??)
    }
}

fn parse_ip(raw: &str) -> Result<IpAddr, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Unavailable(format!("corrupt ip address in store: {raw}")))
}

fn flag_from_row(row: &PgRow) -> Result<Flag, StoreError> {
    Ok(Flag {
        id: FlagId(row.try_get::<Uuid, _>("id")?),
        key: row.try_get::<String, _>("key")?,
        name: row.try_get::<String, _>("name")?,
        enabled: row.try_get::<bool, _>("enabled")?,
    })
}

fn rule_from_row(row: &PgRow) -> Result<Rule, StoreError> {
    let org_ids: BTreeSet<OrgId> =
        serde_json::from_value(row.try_get::<serde_json::Value, _>("organization_ids")?)
            .map_err(|e| StoreError::Unavailable(format!("corrupt organization_ids: {e}")))?;
    Ok(Rule {
        id: RuleId(row.try_get::<Uuid, _>("id")?),
        flag_id: FlagId(row.try_get::<Uuid, _>("flag_id")?),
        kind: RuleKind::from(row.try_get::<String, _>("type")?),
        org_ids,
        percentage: row.try_get::<f64, _>("percentage")?,
        priority: row.try_get::<i32, _>("priority")?,
        enabled: row.try_get::<bool, _>("enabled")?,
    })
}

fn override_from_row(row: &PgRow) -> Result<Override, StoreError> {
    Ok(Override {
        id: row.try_get::<Uuid, _>("id")?,
        flag_id: FlagId(row.try_get::<Uuid, _>("flag_id")?),
        org_id: OrgId(row.try_get::<Uuid, _>("organization_id")?),
        enabled: row.try_get::<bool, _>("enabled")?,
        reason: row.try_get::<String, _>("reason")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry, StoreError> {
    let detail: AuditDetail =
        serde_json::from_value(row.try_get::<serde_json::Value, _>("metadata")?)
            .map_err(|e| StoreError::Unavailable(format!("corrupt audit metadata: {e}")))?;
    Ok(AuditEntry {
        id: row.try_get::<Uuid, _>("id")?,
        flag_id: FlagId(row.try_get::<Uuid, _>("flag_id")?),
        action: AuditAction::from(row.try_get::<String, _>("action")?),
        org_id: row.try_get::<Option<Uuid>, _>("organization_id")?.map(OrgId),
        user_id: row.try_get::<Option<Uuid>, _>("user_id")?.map(UserId),
        detail,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn binding_from_row(row: &PgRow) -> Result<SessionBinding, StoreError> {
    let bound_ip = match row.try_get::<Option<String>, _>("ip_address")? {
        Some(raw) => Some(parse_ip(&raw)?),
        None => None,
    };
    Ok(SessionBinding {
        session_id: SessionId(row.try_get::<String, _>("id")?),
        org_id: OrgId(row.try_get::<Uuid, _>("organization_id")?),
        user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
        bound_ip,
        bound_user_agent: row.try_get::<Option<String>, _>("user_agent")?,
    })
}

fn hijack_from_row(row: &PgRow) -> Result<HijackAttempt, StoreError> {
    Ok(HijackAttempt {
        id: row.try_get::<Uuid, _>("id")?,
        org_id: OrgId(row.try_get::<Uuid, _>("organization_id")?),
        user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
        session_id: SessionId(row.try_get::<String, _>("session_id")?),
        mismatch: crate::api::MismatchType::from(row.try_get::<String, _>("mismatch_type")?),
        expected_ip: parse_ip(&row.try_get::<String, _>("expected_ip")?)?,
        actual_ip: parse_ip(&row.try_get::<String, _>("actual_ip")?)?,
        expected_user_agent: row.try_get::<String, _>("expected_user_agent")?,
        actual_user_agent: row.try_get::<String, _>("actual_user_agent")?,
        action: crate::api::GuardAction::from(row.try_get::<String, _>("action")?),
        blocked: row.try_get::<bool, _>("blocked")?,
        request_path: row.try_get::<String, _>("request_path")?,
        request_method: row.try_get::<String, _>("request_method")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl TrustStore for PgStore {
    async fn create_flag(&self, flag: Flag) -> Result<(), StoreError> {
        self.run(async {
            sqlx::query("INSERT INTO flags (id, key, name, enabled) VALUES ($1, $2, $3, $4)")
                .bind(flag.id.0)
                .bind(&flag.key)
                .bind(&flag.name)
                .bind(flag.enabled)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_flag(&self, key: &str) -> Result<Option<Flag>, StoreError> {
        let row = self
            .run(
                sqlx::query("SELECT id, key, name, enabled FROM flags WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn get_flag_by_id(&self, flag_id: FlagId) -> Result<Option<Flag>, StoreError> {
        let row = self
            .run(
                sqlx::query("SELECT id, key, name, enabled FROM flags WHERE id = $1")
                    .bind(flag_id.0)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError> {
        let rows = self
            .run(
                sqlx::query(
                    "SELECT id, flag_id, type, organization_ids, percentage, priority, enabled \
                     FROM flag_rules WHERE flag_id = $1 ORDER BY priority ASC, id ASC",
                )
                .bind(flag_id.0)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn upsert_rule(&self, rule: Rule, audit: AuditEntry) -> Result<(), StoreError> {
        let org_ids = serde_json::to_value(&rule.org_ids)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let metadata = serde_json::to_value(&audit.detail)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.run(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "INSERT INTO flag_rules (id, flag_id, type, organization_ids, percentage, priority, enabled) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO UPDATE SET type = EXCLUDED.type, \
                 organization_ids = EXCLUDED.organization_ids, percentage = EXCLUDED.percentage, \
                 priority = EXCLUDED.priority, enabled = EXCLUDED.enabled",
            )
            .bind(rule.id.0)
            .bind(rule.flag_id.0)
            .bind(rule.kind.as_str())
            .bind(&org_ids)
            .bind(rule.percentage)
            .bind(rule.priority)
            .bind(rule.enabled)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO flag_audit_logs (id, flag_id, action, organization_id, user_id, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(audit.id)
            .bind(audit.flag_id.0)
            .bind(audit.action.as_str())
            .bind(audit.org_id.map(|o| o.0))
            .bind(audit.user_id.map(|u| u.0))
            .bind(&metadata)
            .bind(audit.created_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
    ) -> Result<Option<Override>, StoreError> {
        let row = self
            .run(
                sqlx::query(
                    "SELECT id, flag_id, organization_id, enabled, reason, expires_at \
                     FROM flag_overrides WHERE flag_id = $1 AND organization_id = $2",
                )
                .bind(flag_id.0)
                .bind(org_id.0)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.as_ref().map(override_from_row).transpose()
    }

    async fn put_override(&self, ov: Override, audit: AuditEntry) -> Result<(), StoreError> {
        let metadata = serde_json::to_value(&audit.detail)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.run(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "INSERT INTO flag_overrides (id, flag_id, organization_id, enabled, reason, expires_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (flag_id, organization_id) DO UPDATE SET \
                 enabled = EXCLUDED.enabled, reason = EXCLUDED.reason, expires_at = EXCLUDED.expires_at",
            )
            .bind(ov.id)
            .bind(ov.flag_id.0)
            .bind(ov.org_id.0)
            .bind(ov.enabled)
            .bind(&ov.reason)
            .bind(ov.expires_at)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO flag_audit_logs (id, flag_id, action, organization_id, user_id, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(audit.id)
            .bind(audit.flag_id.0)
            .bind(audit.action.as_str())
            .bind(audit.org_id.map(|o| o.0))
            .bind(audit.user_id.map(|u| u.0))
            .bind(&metadata)
            .bind(audit.created_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn clear_override(
        &self,
        flag_id: FlagId,
        org_id: OrgId,
        audit: AuditEntry,
    ) -> Result<(), StoreError> {
        let metadata = serde_json::to_value(&audit.detail)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.run(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM flag_overrides WHERE flag_id = $1 AND organization_id = $2")
                .bind(flag_id.0)
                .bind(org_id.0)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO flag_audit_logs (id, flag_id, action, organization_id, user_id, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(audit.id)
            .bind(audit.flag_id.0)
            .bind(audit.action.as_str())
            .bind(audit.org_id.map(|o| o.0))
            .bind(audit.user_id.map(|u| u.0))
            .bind(&metadata)
            .bind(audit.created_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn list_audit(&self, flag_id: FlagId) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = self
            .run(
                sqlx::query(
                    "SELECT id, flag_id, action, organization_id, user_id, metadata, created_at \
                     FROM flag_audit_logs WHERE flag_id = $1 ORDER BY created_at ASC, id ASC",
                )
                .bind(flag_id.0)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(async {
            let admin = sqlx::query("DELETE FROM flag_audit_logs WHERE created_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            let security =
                sqlx::query("DELETE FROM session_hijacking_attempts WHERE created_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?;
            Ok(admin.rows_affected() + security.rows_affected())
        })
        .await
    }

    async fn create_binding(&self, binding: SessionBinding) -> Result<(), StoreError> {
        self.run(async {
            sqlx::query(
                "INSERT INTO sessions (id, organization_id, user_id, ip_address, user_agent) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO UPDATE SET organization_id = EXCLUDED.organization_id, \
                 user_id = EXCLUDED.user_id, ip_address = EXCLUDED.ip_address, \
                 user_agent = EXCLUDED.user_agent",
            )
            .bind(binding.session_id.as_str())
            .bind(binding.org_id.0)
            .bind(binding.user_id.0)
            .bind(binding.bound_ip.map(|ip| ip.to_string()))
            .bind(&binding.bound_user_agent)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_binding(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Option<SessionBinding>, StoreError> {
        let row = self
            .run(
                sqlx::query(
                    "SELECT id, organization_id, user_id, ip_address, user_agent \
                     FROM sessions WHERE id = $1",
                )
                .bind(session_id.as_str())
                .fetch_optional(&self.pool),
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let binding = binding_from_row(&row)?;
                if binding.org_id != org_id {
                    return Err(StoreError::OrgScopeViolation);
                }
                Ok(Some(binding))
            }
        }
    }

    async fn bind_if_unbound(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
        ip: IpAddr,
        user_agent: &str,
    ) -> Result<BindOutcome, StoreError> {
        // Atomic conditional store, not read-then-write: a single winner
        // under concurrent first requests.
        let updated = self
            .run(
                sqlx::query(
                    "UPDATE sessions SET ip_address = $3, user_agent = $4 \
                     WHERE id = $1 AND organization_id = $2 \
                     AND ip_address IS NULL AND user_agent IS NULL",
                )
                .bind(session_id.as_str())
                .bind(org_id.0)
                .bind(ip.to_string())
                .bind(user_agent)
                .execute(&self.pool),
            )
            .await?;
        if updated.rows_affected() == 1 {
            return Ok(BindOutcome::Bound);
        }

        let row = self
            .run(
                sqlx::query("SELECT organization_id FROM sessions WHERE id = $1")
                    .bind(session_id.as_str())
                    .fetch_optional(&self.pool),
            )
            .await?;
        match row {
            None => Ok(BindOutcome::Missing),
            Some(row) => {
                if OrgId(row.try_get::<Uuid, _>("organization_id")?) != org_id {
                    return Err(StoreError::OrgScopeViolation);
                }
                Ok(BindOutcome::AlreadyBound)
            }
        }
    }

    async fn invalidate_session(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<(), StoreError> {
        // Single statement: the delete only touches the caller's org, and
        // the returned row distinguishes missing from wrong-org.
        let row = self
            .run(
                sqlx::query(
                    "WITH target AS (SELECT organization_id FROM sessions WHERE id = $1), \
                     removed AS (DELETE FROM sessions \
                     WHERE id = $1 AND organization_id = $2 RETURNING id) \
                     SELECT organization_id FROM target",
                )
                .bind(session_id.as_str())
                .bind(org_id.0)
                .fetch_optional(&self.pool),
            )
            .await?;
        match row {
            None => Ok(()),
            Some(row) => {
                if OrgId(row.try_get::<Uuid, _>("organization_id")?) != org_id {
                    return Err(StoreError::OrgScopeViolation);
                }
                Ok(())
            }
        }
    }

    async fn record_hijack_attempt(&self, attempt: HijackAttempt) -> Result<(), StoreError> {
        self.run(async {
            sqlx::query(
                "INSERT INTO session_hijacking_attempts \
                 (id, organization_id, user_id, session_id, mismatch_type, expected_ip, actual_ip, \
                  expected_user_agent, actual_user_agent, action, blocked, request_path, request_method, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(attempt.id)
            .bind(attempt.org_id.0)
            .bind(attempt.user_id.0)
            .bind(attempt.session_id.as_str())
            .bind(attempt.mismatch.as_str())
            .bind(attempt.expected_ip.to_string())
            .bind(attempt.actual_ip.to_string())
            .bind(&attempt.expected_user_agent)
            .bind(&attempt.actual_user_agent)
            .bind(attempt.action.as_str())
            .bind(attempt.blocked)
            .bind(&attempt.request_path)
            .bind(&attempt.request_method)
            .bind(attempt.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_hijack_attempts(
        &self,
        session_id: &SessionId,
        org_id: OrgId,
    ) -> Result<Vec<HijackAttempt>, StoreError> {
        let rows = self
            .run(
                sqlx::query(
                    "SELECT id, organization_id, user_id, session_id, mismatch_type, expected_ip, \
                     actual_ip, expected_user_agent, actual_user_agent, action, blocked, \
                     request_path, request_method, created_at \
                     FROM session_hijacking_attempts \
                     WHERE session_id = $1 AND organization_id = $2 \
                     ORDER BY created_at ASC, id ASC",
                )
                .bind(session_id.as_str())
                .bind(org_id.0)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(hijack_from_row).collect()
    }
}
