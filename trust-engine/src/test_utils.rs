use anyhow::Error;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;

use crate::config::Config;
use crate::engine::TrustEngine;
use crate::flag_definitions::Flag;
use crate::ids::{FlagId, OrgId, SessionId, UserId};
use crate::memory_store::MemoryStore;
use crate::session_guard::RequestContext;
use crate::store::TrustStore;

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub fn setup_engine() -> (TrustEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = TrustEngine::new(store.clone(), &Config::default_test_config());
    (engine, store)
}

pub async fn insert_flag(
    store: &Arc<MemoryStore>,
    key: &str,
    enabled: bool,
) -> Result<Flag, Error> {
    let flag = Flag {
        id: FlagId::new(),
        key: key.to_string(),
        name: key.to_string(),
        enabled,
    };
    store.create_flag(flag.clone()).await?;
    Ok(flag)
}

pub fn request_from(ip: &str, user_agent: &str) -> RequestContext {
    RequestContext {
        ip: ip.parse().expect("test ip should parse"),
        user_agent: user_agent.to_string(),
        path: "/api/projects".to_string(),
        method: "GET".to_string(),
    }
}

pub async fn issue_session(
    engine: &TrustEngine,
    org_id: OrgId,
    user_id: UserId,
) -> Result<SessionId, Error> {
    let session_id = SessionId(random_string("sess_", 16));
    engine
        .issue_session(session_id.clone(), org_id, user_id)
        .await?;
    Ok(session_id)
}
