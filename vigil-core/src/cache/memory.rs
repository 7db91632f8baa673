use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{CacheEntry, Fingerprint, ResultCache};
use crate::{
    error::Result,
    types::{AgentSet, ConsensusFinding},
};

/// Process-local result cache keyed by the content part of the fingerprint.
#[derive(Clone, Default)]
pub struct InMemoryResultCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl fmt::Debug for InMemoryResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entries.try_read() {
            Ok(guard) => f
                .debug_struct("InMemoryResultCache")
                .field("entries", &guard.len())
                .finish(),
            Err(_) => f
                .debug_struct("InMemoryResultCache")
                .field("entries", &"<locked>")
                .finish(),
        }
    }
}

impl InMemoryResultCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries. Lookups already ignore them; this only bounds
    /// memory.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.is_fresh(now));
        before - guard.len()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        required: &AgentSet,
    ) -> Result<Option<CacheEntry>> {
        let guard = self.entries.read().await;
        let hit = guard
            .get(&fingerprint.content)
            .filter(|entry| entry.serves(required, Utc::now()))
            .cloned();
        debug!(
            target: "vigil::cache",
            fingerprint = %fingerprint.content,
            hit = hit.is_some(),
            "cache lookup"
        );
        Ok(hit)
    }

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        agents: &AgentSet,
        findings: &[ConsensusFinding],
        ttl: Duration,
    ) -> Result<()> {
        let entry = CacheEntry::new(
            fingerprint.clone(),
            agents.clone(),
            findings.to_vec(),
            ttl,
        );
        self.entries
            .write()
            .await
            .insert(fingerprint.content.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.entries.write().await.remove(&fingerprint.content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentName, ScanRequest};

    fn agents(names: &[&str]) -> AgentSet {
        names.iter().map(|n| AgentName::from(*n)).collect()
    }

    fn fingerprint(stored: &AgentSet) -> Fingerprint {
        Fingerprint::compute(&ScanRequest::new("acme/api", "abc").target(), stored)
    }

    #[tokio::test]
    async fn subset_hits_superset_misses() {
        let cache = InMemoryResultCache::new();
        let stored = agents(&["gosec", "semgrep"]);
        let fp = fingerprint(&stored);
        cache
            .store(&fp, &stored, &[], Duration::from_secs(60))
            .await
            .unwrap();

        for required in [agents(&["gosec"]), stored.clone(), AgentSet::new()] {
            let hit = cache.lookup(&fp, &required).await.unwrap();
            assert!(hit.is_some(), "{required:?} should hit");
            assert_eq!(hit.unwrap().agents, stored);
        }

        let wider = agents(&["gosec", "semgrep", "bandit"]);
        assert!(cache.lookup(&fp, &wider).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        let cache = InMemoryResultCache::new();
        let stored = agents(&["gosec"]);
        let fp = fingerprint(&stored);
        cache.store(&fp, &stored, &[], Duration::ZERO).await.unwrap();

        assert!(cache.lookup(&fp, &stored).await.unwrap().is_none());
        assert_eq!(cache.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let cache = InMemoryResultCache::new();
        let wide = agents(&["gosec", "semgrep"]);
        let narrow = agents(&["gosec"]);
        let fp = fingerprint(&wide);
        let ttl = Duration::from_secs(60);
        cache.store(&fp, &wide, &[], ttl).await.unwrap();
        cache.store(&fp, &narrow, &[], ttl).await.unwrap();

        assert!(cache.lookup(&fp, &wide).await.unwrap().is_none());
        cache.invalidate(&fp).await.unwrap();
        assert!(cache.lookup(&fp, &narrow).await.unwrap().is_none());
    }
}
