//! In-request retry for remote API calls.
//!
//! A request that fails with a transient error (429, 5xx, connection reset,
//! timeout) is repeated after a doubling delay: 2s, 4s, 8s by default. A
//! `Retry-After` hint from the server replaces the computed delay. Any other
//! error ends the request at once; queue-level retry takes over from there.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::error::SourceError;

/// Upper bound on a server-requested `Retry-After` delay.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// How often and how patiently a request is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Repeats after the first attempt.
    pub max_retries: u32,

    /// Delay before the first repeat; doubles for each further one.
    pub base_delay: Duration,

    /// Cap on the doubled delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
    };

    /// A single attempt.
    pub const NONE: Self = Self {
        max_retries: 0,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before repeat number `retry` (0-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << retry.min(31))
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a retried request ended.
#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),

    /// Still transient after the last repeat.
    ExhaustedRetries { last_error: SourceError, attempts: u32 },

    /// Not transient, so not repeated.
    Failed(SourceError),
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> Result<T, SourceError> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::ExhaustedRetries { last_error, .. } | RetryResult::Failed(last_error) => {
                Err(last_error)
            }
        }
    }
}

/// Runs `request` until it succeeds, fails permanently, or retries run out.
pub async fn retry_with_backoff<T, F, Fut>(config: RetryConfig, mut request: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempts = 0;
    loop {
        let err = match request().await {
            Ok(value) => return RetryResult::Success(value),
            Err(err) => err,
        };
        attempts += 1;

        if !err.kind.is_retriable() {
            return RetryResult::Failed(err);
        }
        if attempts > config.max_retries {
            return RetryResult::ExhaustedRetries {
                last_error: err,
                attempts,
            };
        }

        let delay = match err.retry_after {
            Some(hint) => hint.min(MAX_RETRY_AFTER),
            None => config.delay_for_attempt(attempts - 1),
        };
        warn!(attempts, ?delay, error = %err, "Transient remote error, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::error::SourceErrorKind;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A request that returns the scripted results in order and counts calls.
    #[derive(Clone)]
    struct Script {
        results: Arc<Mutex<VecDeque<Result<u32, SourceError>>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl Script {
        fn new(results: Vec<Result<u32, SourceError>>) -> Self {
            Script {
                results: Arc::new(Mutex::new(results.into())),
                calls: Arc::new(Mutex::new(0)),
            }
        }

        fn call(&self) -> impl Future<Output = Result<u32, SourceError>> + use<> {
            *self.calls.lock().unwrap() += 1;
            let next = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::transient("script exhausted")));
            async move { next }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1), Duration::from_millis(10))
    }

    // ─── Unit Tests ───────────────────────────────────────────────────────────

    #[test]
    fn default_delays_are_2_4_8() {
        let delays: Vec<_> = (0..RetryConfig::DEFAULT.max_retries)
            .map(|retry| RetryConfig::DEFAULT.delay_for_attempt(retry))
            .collect();
        assert_eq!(
            delays,
            [2, 4, 8].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(
            RetryConfig::DEFAULT.delay_for_attempt(40),
            Duration::from_secs(16)
        );
    }

    #[tokio::test]
    async fn first_success_is_returned() {
        let script = Script::new(vec![Ok(42)]);

        let result = retry_with_backoff(RetryConfig::DEFAULT, || script.call()).await;

        assert_eq!(result.into_result().unwrap(), 42);
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_end_the_request() {
        for kind in [
            SourceErrorKind::NotFound,
            SourceErrorKind::Expired,
            SourceErrorKind::Rejected,
        ] {
            let script = Script::new(vec![Err(SourceError::new(kind, "no")), Ok(1)]);

            let result = retry_with_backoff(fast(3), || script.call()).await;

            assert!(matches!(result, RetryResult::Failed(ref e) if e.kind == kind));
            assert_eq!(script.calls(), 1, "{kind:?}");
        }
    }

    #[tokio::test]
    async fn transient_errors_are_repeated_until_success() {
        let script = Script::new(vec![
            Err(SourceError::transient("503")),
            Err(SourceError::transient("timed out")),
            Ok(7),
        ]);

        let result = retry_with_backoff(fast(3), || script.call()).await;

        assert!(matches!(result, RetryResult::Success(7)));
        assert_eq!(script.calls(), 3);
    }

    #[tokio::test]
    async fn retries_run_out() {
        let script = Script::new(vec![]);

        let result = retry_with_backoff(fast(2), || script.call()).await;

        match result {
            RetryResult::ExhaustedRetries { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected ExhaustedRetries, got {other:?}"),
        }
        assert_eq!(script.calls(), 3);
    }

    #[tokio::test]
    async fn none_makes_a_single_attempt() {
        let script = Script::new(vec![]);

        let result = retry_with_backoff(RetryConfig::NONE, || script.call()).await;

        assert!(matches!(
            result,
            RetryResult::ExhaustedRetries { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn retry_after_replaces_computed_delay() {
        let limited = SourceError::transient("429").with_retry_after(Some(Duration::from_millis(50)));
        let script = Script::new(vec![Err(limited), Ok(0)]);
        let started = std::time::Instant::now();

        let result = retry_with_backoff(fast(3), || script.call()).await;

        assert!(matches!(result, RetryResult::Success(0)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    // ─── Property Tests ───────────────────────────────────────────────────────

    proptest! {
        #[test]
        fn delays_never_shrink_and_respect_cap(
            base_ms in 1u64..1000,
            cap_ms in 1000u64..60000,
            max_retries in 1u32..40,
        ) {
            let config = RetryConfig::new(
                max_retries,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );

            let delays: Vec<_> = (0..config.max_retries)
                .map(|retry| config.delay_for_attempt(retry))
                .collect();
            prop_assert_eq!(delays.len(), max_retries as usize);
            prop_assert!(delays.windows(2).all(|w| w[1] >= w[0]));
            prop_assert!(delays.iter().all(|d| *d <= Duration::from_millis(cap_ms)));
        }
    }
}
