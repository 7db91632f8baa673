//! Fingerprint-addressed storage of consensus results.
//!
//! Entries are derived data: a miss only costs a rescan, so every backend
//! is last-writer-wins and callers treat backend errors as misses.

mod fingerprint;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    types::{AgentSet, ConsensusFinding},
};

pub use fingerprint::Fingerprint;
pub use memory::InMemoryResultCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisResultCache;

/// Stored result for one fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key the entry was stored under.
    pub fingerprint: Fingerprint,
    /// Agents whose reports produced `findings`.
    pub agents: AgentSet,
    pub findings: Vec<ConsensusFinding>,
    /// When consensus ran.
    pub computed_at: DateTime<Utc>,
    /// Lookups at or after this instant miss.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry computed now and valid for `ttl`; an out-of-range `ttl` falls
    /// back to one day.
    pub fn new(
        fingerprint: Fingerprint,
        agents: AgentSet,
        findings: Vec<ConsensusFinding>,
        ttl: Duration,
    ) -> Self {
        let computed_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            fingerprint,
            agents,
            findings,
            computed_at,
            expires_at: computed_at + ttl,
        }
    }

    /// A result computed with fewer agents than required cannot stand in
    /// for the full run.
    pub fn covers(&self, required: &AgentSet) -> bool {
        required.is_subset(&self.agents)
    }

    /// True until `expires_at`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn serves(&self, required: &AgentSet, now: DateTime<Utc>) -> bool {
        self.is_fresh(now) && self.covers(required)
    }
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Hit only if the stored agent set is a superset of `required` and the
    /// entry has not expired.
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        required: &AgentSet,
    ) -> Result<Option<CacheEntry>>;

    /// Idempotent, last-writer-wins.
    async fn store(
        &self,
        fingerprint: &Fingerprint,
        agents: &AgentSet,
        findings: &[ConsensusFinding],
        ttl: Duration,
    ) -> Result<()>;

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()>;
}
