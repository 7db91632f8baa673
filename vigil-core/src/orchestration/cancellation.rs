use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::JobId;

struct JobTokens {
    token: CancellationToken,
    attempts: usize,
}

/// Per-job cancellation tokens for the tasks running in this process.
///
/// Each running attempt holds a child of its job's token, so cancelling the
/// job reaches every outstanding attempt. A job's entry lives exactly as long
/// as its attempts: the last [`AttemptToken`] to drop removes it. Processes
/// that did not run the cancel call learn about it through the dispatcher's
/// status polling.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<JobId, JobTokens>>,
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("active_jobs", &self.tokens.len())
            .finish()
    }
}

/// Cancellation handle for one attempt. Dropping it releases the attempt's
/// claim on the job entry.
#[derive(Debug)]
pub struct AttemptToken {
    registry: CancellationRegistry,
    job_id: JobId,
    token: CancellationToken,
}

impl AttemptToken {
    /// Child token handed to the adapter.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for AttemptToken {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
    }
}

impl CancellationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one attempt of a task belonging to `job_id`.
    pub fn attempt(&self, job_id: JobId) -> AttemptToken {
        let mut entry = self.tokens.entry(job_id).or_insert_with(|| JobTokens {
            token: CancellationToken::new(),
            attempts: 0,
        });
        entry.attempts += 1;
        let token = entry.token.child_token();
        drop(entry);
        AttemptToken {
            registry: self.clone(),
            job_id,
            token,
        }
    }

    fn release(&self, job_id: JobId) {
        if let Entry::Occupied(mut entry) = self.tokens.entry(job_id) {
            let tokens = entry.get_mut();
            tokens.attempts = tokens.attempts.saturating_sub(1);
            if tokens.attempts == 0 {
                entry.remove();
            }
        }
    }

    /// Signals every attempt of `job_id` running in this process. Returns
    /// whether any were running.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.tokens.get(&job_id) {
            Some(tokens) => {
                debug!(target: "vigil::dispatch", job = %job_id, attempts = tokens.attempts, "cancelling outstanding tasks");
                tokens.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Jobs with at least one attempt running in this process.
    pub fn active_jobs(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_every_child() {
        let registry = CancellationRegistry::new();
        let job = JobId::new();
        let a = registry.attempt(job);
        let b = registry.attempt(job);
        let other = registry.attempt(JobId::new());

        assert!(registry.cancel(job));
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        assert!(!other.token().is_cancelled());
        assert_eq!(registry.active_jobs(), 2);
    }

    #[test]
    fn entry_is_dropped_with_the_last_attempt() {
        let registry = CancellationRegistry::new();
        let job = JobId::new();
        let a = registry.attempt(job);
        let b = registry.attempt(job);

        drop(a);
        assert_eq!(registry.active_jobs(), 1);
        drop(b);
        assert_eq!(registry.active_jobs(), 0);
        assert!(!registry.cancel(job));
    }

    #[test]
    fn attempts_after_a_cancel_start_cancelled_until_released() {
        let registry = CancellationRegistry::new();
        let job = JobId::new();
        let running = registry.attempt(job);
        registry.cancel(job);

        let late = registry.attempt(job);
        assert!(late.token().is_cancelled());
        drop(running);
        drop(late);

        let fresh = registry.attempt(job);
        assert!(!fresh.token().is_cancelled());
    }
}
