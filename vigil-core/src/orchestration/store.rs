use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::{Result, ScanError},
    types::{JobId, ScanJob},
};

/// Durable record store for scan jobs.
///
/// Every update is a compare-and-swap on [`ScanJob::revision`], which is how
/// concurrent orchestrator instances serialize their changes to one job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails if the id is already taken.
    async fn create(&self, job: &ScanJob) -> Result<()>;

    async fn load(&self, id: JobId) -> Result<Option<ScanJob>>;

    /// Replace the stored record if its revision still equals
    /// `expected_revision`. `job.revision` must already carry the new value.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        job: &ScanJob,
        expected_revision: u64,
    ) -> Result<bool>;

    /// Ids of jobs that are not terminal yet.
    async fn list_active(&self) -> Result<Vec<JobId>>;

    /// Ids of every retained job, newest first.
    async fn list_jobs(&self) -> Result<Vec<JobId>>;
}

/// Process-local job store.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, ScanJob>>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.jobs.try_read() {
            Ok(guard) => f
                .debug_struct("InMemoryJobStore")
                .field("jobs", &guard.len())
                .finish(),
            Err(_) => f
                .debug_struct("InMemoryJobStore")
                .field("jobs", &"<locked>")
                .finish(),
        }
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &ScanJob) -> Result<()> {
        let mut guard = self.jobs.write().await;
        if guard.contains_key(&job.id) {
            return Err(ScanError::Internal(format!(
                "job {} already exists",
                job.id
            )));
        }
        guard.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<ScanJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        job: &ScanJob,
        expected_revision: u64,
    ) -> Result<bool> {
        let mut guard = self.jobs.write().await;
        match guard.get_mut(&job.id) {
            Some(stored) if stored.revision == expected_revision => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ScanError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn list_active(&self) -> Result<Vec<JobId>> {
        let guard = self.jobs.read().await;
        let mut ids: Vec<JobId> = guard
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_jobs(&self) -> Result<Vec<JobId>> {
        let guard = self.jobs.read().await;
        let mut ids: Vec<JobId> = guard.keys().copied().collect();
        // UUIDv7 ids sort by creation time.
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}
