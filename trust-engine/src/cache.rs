use std::sync::Arc;
use std::time::Duration;

use crate::flag_definitions::{Flag, Rule};

/// Flag definition plus its rules, cached as one unit so a decision never
/// mixes a new flag with stale rules.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSnapshot {
    pub flag: Flag,
    pub rules: Vec<Rule>,
}

/// Short-TTL read cache for flag/rule snapshots, keyed by flag key.
/// Overrides and session bindings are never cached: overrides always win a
/// decision and bindings are a security signal, so both are read fresh.
/// Mutations invalidate the affected key synchronously before returning.
#[derive(Clone)]
pub struct FlagCache {
    inner: moka::sync::Cache<String, Arc<FlagSnapshot>>,
}

impl FlagCache {
    pub fn new(ttl: Duration) -> Self {
        FlagCache {
            inner: moka::sync::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<FlagSnapshot>> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: &str, snapshot: Arc<FlagSnapshot>) {
        self.inner.insert(key.to_string(), snapshot);
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }
}
