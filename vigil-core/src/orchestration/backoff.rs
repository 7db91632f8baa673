use std::{
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

use super::config::RetryConfig;
use crate::types::TaskId;

/// Exponential backoff with deterministic jitter.
///
/// The jitter is derived from `(task, attempt)` rather than an RNG so that a
/// retry schedule can be reproduced from the queue record alone.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// True once `attempts` executions have used up the retry budget.
    pub fn exhausted(&self, attempts: u16) -> bool {
        attempts >= self.config.max_attempts
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, task_id: TaskId, attempt: u16) -> Duration {
        let anchor = self.anchor_delay_ms(attempt);
        Duration::from_millis(self.jittered(anchor, task_id, attempt))
    }

    fn anchor_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 || self.config.backoff_base_ms == 0 {
            return 0;
        }
        let exponent = u32::from(attempt - 1).min(32);
        self.config
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_ms)
    }

    fn jittered(&self, anchor_ms: u64, task_id: TaskId, attempt: u16) -> u64 {
        if anchor_ms == 0 {
            return 0;
        }

        let max = self.config.backoff_max_ms as f64;
        let ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let span = ((anchor_ms as f64) * ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(max);

        let lower = 0f64.max(anchor_ms as f64 - span);
        let upper = (anchor_ms as f64 + span).min(max);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = deterministic_unit(task_id, attempt);
        (lower + (upper - lower) * unit).round() as u64
    }
}

fn deterministic_unit(task_id: TaskId, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    task_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    (hasher.finish() as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 4,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 100,
        })
    }

    #[test]
    fn delay_grows_and_stays_within_jitter_bounds() {
        let policy = policy();
        let task = TaskId(Uuid::now_v7());

        for (attempt, anchor) in [(1u16, 1_000u64), (2, 2_000), (3, 4_000)] {
            let delay = policy.delay_for(task, attempt).as_millis() as u64;
            let span = (anchor / 4).max(100);
            assert!(
                delay >= anchor - span && delay <= anchor + span,
                "attempt {attempt}: {delay}ms outside {anchor}±{span}"
            );
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy();
        let task = TaskId(Uuid::now_v7());
        assert!(policy.delay_for(task, 30) <= Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_is_reproducible() {
        let policy = policy();
        let task = TaskId(Uuid::now_v7());
        assert_eq!(policy.delay_for(task, 2), policy.delay_for(task, 2));
    }

    #[test]
    fn exhaustion_tracks_max_attempts() {
        let policy = policy();
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
