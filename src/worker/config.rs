//! Worker pool timing.
//!
//! # Idle Backoff
//!
//! A worker that finds the queue empty sleeps before claiming again. The
//! sleep doubles on each consecutive empty claim, from `idle_backoff_min` up
//! to `idle_backoff_max`, and resets as soon as the worker finds work.
//!
//! Each worker adds a small deterministic jitter (0-20%) derived from its
//! index, so a pool started at once does not scan the spool in lockstep.

use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default age after which a claim is considered abandoned (30 minutes).
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 1800;

/// Default interval between stale-claim sweeps (5 minutes).
pub const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 300;

const DEFAULT_IDLE_BACKOFF_MIN_MS: u64 = 500;
const DEFAULT_IDLE_BACKOFF_MAX_SECS: u64 = 30;
const DEFAULT_JITTER_PERCENT: u8 = 20;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks.
    pub concurrency: usize,

    /// Claims older than this are returned to pending by the maintenance task.
    ///
    /// Must exceed the longest expected download, otherwise a slow download
    /// is reclaimed and processed twice.
    pub visibility_timeout: Duration,

    /// Interval between stale-claim sweeps.
    pub reclaim_interval: Duration,

    /// First sleep after an empty claim.
    pub idle_backoff_min: Duration,

    /// Ceiling for the empty-queue sleep.
    pub idle_backoff_max: Duration,

    /// Jitter percentage added to the idle backoff (0-100).
    pub jitter_percent: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        WorkerConfig {
            concurrency: DEFAULT_WORKER_COUNT,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            reclaim_interval: Duration::from_secs(DEFAULT_RECLAIM_INTERVAL_SECS),
            idle_backoff_min: Duration::from_millis(DEFAULT_IDLE_BACKOFF_MIN_MS),
            idle_backoff_max: Duration::from_secs(DEFAULT_IDLE_BACKOFF_MAX_SECS),
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// Sleep after `consecutive_idle` empty claims in a row (1-based).
    ///
    /// # Formula
    ///
    /// `min(idle_backoff_min * 2^(n-1), idle_backoff_max) * (1 + jitter(worker) / 100)`
    pub fn idle_backoff(&self, worker: usize, consecutive_idle: u32) -> Duration {
        let shift = consecutive_idle.saturating_sub(1).min(16);
        let base = self
            .idle_backoff_min
            .saturating_mul(1u32 << shift)
            .min(self.idle_backoff_max);
        base.mul_f64(self.jitter_factor(worker))
    }

    /// Returns a value between 1.0 and 1.0 + (jitter_percent / 100).
    fn jitter_factor(&self, worker: usize) -> f64 {
        if self.jitter_percent == 0 {
            return 1.0;
        }
        let mut hasher = std::hash::DefaultHasher::new();
        worker.hash(&mut hasher);
        let jitter = (hasher.finish() % self.jitter_percent as u64) as f64 / 100.0;
        1.0 + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = WorkerConfig::new();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.visibility_timeout, Duration::from_secs(1800));
        assert_eq!(config.reclaim_interval, Duration::from_secs(300));
    }

    #[test]
    fn idle_backoff_doubles_then_caps() {
        let config = WorkerConfig {
            jitter_percent: 0,
            ..WorkerConfig::new()
        };

        assert_eq!(config.idle_backoff(0, 1), Duration::from_millis(500));
        assert_eq!(config.idle_backoff(0, 2), Duration::from_secs(1));
        assert_eq!(config.idle_backoff(0, 3), Duration::from_secs(2));
        assert_eq!(config.idle_backoff(0, 100), Duration::from_secs(30));
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let config = WorkerConfig::new();

        for worker in 0..8 {
            let a = config.idle_backoff(worker, 1);
            let b = config.idle_backoff(worker, 1);
            assert_eq!(a, b);
            assert!(a >= config.idle_backoff_min);
            assert!(a <= config.idle_backoff_min.mul_f64(1.2));
        }
    }
}
