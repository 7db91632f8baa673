use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, warn};

use super::{CacheEntry, Fingerprint, ResultCache};
use crate::{
    error::{Result, ScanError},
    types::{AgentSet, ConsensusFinding},
};

/// Result cache shared by every node through Redis. Entries carry a Redis
/// TTL matching their logical expiry.
#[derive(Clone)]
pub struct RedisResultCache {
    conn: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisResultCache")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisResultCache {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let conn = crate::redis_conn::connect(redis_url, "result cache").await?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:cache:{}", self.prefix, fingerprint.content)
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        required: &AgentSet,
    ) -> Result<Option<CacheEntry>> {
        let key = self.key(fingerprint);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(|e| {
            ScanError::StorageUnavailable(format!("Redis GET failed: {e}"))
        })?;

        let Some(json) = raw else {
            debug!(target: "vigil::cache", key = %key, "cache miss");
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_str(&json) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "vigil::cache", key = %key, error = %err, "discarding undecodable cache entry");
                return Ok(None);
            }
        };

        let hit = entry.serves(required, Utc::now());
        debug!(target: "vigil::cache", key = %key, hit, "cache lookup");
        Ok(hit.then_some(entry))
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
        let json = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.key(fingerprint), json, ttl.as_secs().max(1))
            .await
            .map_err(|e| {
                ScanError::StorageUnavailable(format!("Redis SETEX failed: {e}"))
            })
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(fingerprint)).await.map_err(|e| {
            ScanError::StorageUnavailable(format!("Redis DEL failed: {e}"))
        })
    }
}
