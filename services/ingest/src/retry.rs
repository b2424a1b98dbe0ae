use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use paysync_common::error::PaysyncError;
use paysync_config::{Backoff, RetryConfig};

/// How a failed remote call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, connection reset, 5xx: retry on the backoff curve.
    Transient,
    /// "Too many requests": cool down, then retry without spending an attempt.
    RateLimited(Option<Duration>),
    /// Anything else: return immediately.
    Fatal,
}

pub trait Retryable {
    fn classify(&self) -> FailureClass;
}

impl Retryable for PaysyncError {
    fn classify(&self) -> FailureClass {
        match self {
            PaysyncError::DatabaseUnavailable(_) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub rate_limit_cooldown: Duration,
    pub max_rate_limit_waits: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            backoff: config.backoff,
            rate_limit_cooldown: config.rate_limit_cooldown,
            max_rate_limit_waits: config.max_rate_limit_waits,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Minimal delays for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff: Backoff::Exponential,
            rate_limit_cooldown: Duration::from_millis(20),
            max_rate_limit_waits: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{op} failed after {attempts} attempts: {last}")]
    Exhausted { op: String, attempts: u32, last: E },

    #[error("{op} still rate-limited after {waits} cool-downs: {last}")]
    RateLimited { op: String, waits: u32, last: E },

    #[error("{op} failed: {error}")]
    Fatal { op: String, error: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::RateLimited { last, .. } => last,
            Self::Fatal { error, .. } => error,
        }
    }
}

/// Wraps remote calls with bounded retries and rate-limit cool-downs.
#[derive(Debug, Clone)]
pub struct Governor {
    policy: RetryPolicy,
}

impl Governor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn with_retry<T, E, F, Fut>(&self, op: &str, mut call: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempts: u32 = 0;
        let mut rate_limit_waits: u32 = 0;

        loop {
            attempts += 1;
            let error = match call().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(op, attempts, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            match error.classify() {
                FailureClass::Fatal => {
                    return Err(RetryError::Fatal {
                        op: op.to_string(),
                        error,
                    });
                }
                FailureClass::RateLimited(retry_after) => {
                    // Cool-downs do not consume the transient attempt budget.
                    attempts -= 1;
                    rate_limit_waits += 1;
                    if rate_limit_waits > self.policy.max_rate_limit_waits {
                        return Err(RetryError::RateLimited {
                            op: op.to_string(),
                            waits: rate_limit_waits - 1,
                            last: error,
                        });
                    }
                    let wait = retry_after
                        .unwrap_or_default()
                        .max(self.policy.rate_limit_cooldown);
                    tracing::warn!(
                        op,
                        wait_ms = wait.as_millis() as u64,
                        waits = rate_limit_waits,
                        "rate-limited, cooling down"
                    );
                    tokio::time::sleep(wait).await;
                }
                FailureClass::Transient => {
                    if attempts >= self.policy.max_attempts {
                        return Err(RetryError::Exhausted {
                            op: op.to_string(),
                            attempts,
                            last: error,
                        });
                    }
                    let delay = self.policy.delay_for(attempts);
                    tracing::warn!(
                        op,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{count} consecutive record errors reached threshold {threshold}")]
pub struct ConsecutiveErrorLimit {
    pub count: u32,
    pub threshold: u32,
}

/// Counts errors across different records; any success resets it.
#[derive(Debug)]
pub struct ConsecutiveErrors {
    threshold: u32,
    count: u32,
}

impl ConsecutiveErrors {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn record_failure(&mut self) -> Result<(), ConsecutiveErrorLimit> {
        self.count += 1;
        if self.count >= self.threshold {
            return Err(ConsecutiveErrorLimit {
                count: self.count,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum TestError {
        Reset,
        TooMany(Option<Duration>),
        Denied,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn classify(&self) -> FailureClass {
            match self {
                Self::Reset => FailureClass::Transient,
                Self::TooMany(after) => FailureClass::RateLimited(*after),
                Self::Denied => FailureClass::Fatal,
            }
        }
    }

    /// Call that fails with `errors` in order, then succeeds.
    async fn scripted(calls: &AtomicU32, errors: &[TestError]) -> Result<u32, TestError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) as usize;
        match errors.get(n) {
            Some(e) => Err(*e),
            None => Ok(n as u32),
        }
    }

    #[test]
    fn linear_delay_grows_by_base() {
        let policy = RetryPolicy {
            backoff: Backoff::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..RetryPolicy::test()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::test()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let governor = Governor::new(RetryPolicy::test());
        let calls = AtomicU32::new(0);
        let errors = [TestError::Reset, TestError::Reset];

        let result = governor
            .with_retry("op", || scripted(&calls, &errors))
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_typed_error() {
        let governor = Governor::new(RetryPolicy::test());
        let calls = AtomicU32::new(0);
        let errors = [TestError::Reset; 5];

        let err = governor
            .with_retry("fetch invoices", || scripted(&calls, &errors))
            .await
            .unwrap_err();
        match err {
            RetryError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, TestError::Reset);
            }
            other => panic!("expected Exhausted, got: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let governor = Governor::new(RetryPolicy::test());
        let calls = AtomicU32::new(0);
        let errors = [TestError::Denied];

        let err = governor
            .with_retry("op", || scripted(&calls, &errors))
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_waits_for_cooldown_then_succeeds() {
        let policy = RetryPolicy {
            rate_limit_cooldown: Duration::from_millis(60),
            ..RetryPolicy::test()
        };
        let governor = Governor::new(policy);
        let calls = AtomicU32::new(0);
        let errors = [TestError::TooMany(None)];

        let started = Instant::now();
        let result = governor.with_retry("op", || scripted(&calls, &errors)).await;
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn rate_limit_honors_longer_retry_after() {
        let governor = Governor::new(RetryPolicy::test());
        let calls = AtomicU32::new(0);
        let errors = [TestError::TooMany(Some(Duration::from_millis(80)))];

        let started = Instant::now();
        governor
            .with_retry("op", || scripted(&calls, &errors))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn rate_limits_do_not_consume_attempts() {
        let governor = Governor::new(RetryPolicy::test());
        let calls = AtomicU32::new(0);
        let errors = [
            TestError::Reset,
            TestError::TooMany(None),
            TestError::TooMany(None),
            TestError::Reset,
        ];

        let result = governor.with_retry("op", || scripted(&calls, &errors)).await;
        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test]
    async fn endless_rate_limiting_terminates() {
        let governor = Governor::new(RetryPolicy::test());
        let calls = AtomicU32::new(0);
        let errors = [TestError::TooMany(None); 10];

        let err = governor
            .with_retry("op", || scripted(&calls, &errors))
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::RateLimited { waits: 3, .. }), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn consecutive_errors_trip_at_threshold_and_reset() {
        let mut counter = ConsecutiveErrors::new(3);
        assert!(counter.record_failure().is_ok());
        assert!(counter.record_failure().is_ok());
        counter.record_success();

        assert!(counter.record_failure().is_ok());
        assert!(counter.record_failure().is_ok());
        let err = counter.record_failure().unwrap_err();
        assert_eq!(err.count, 3);
        assert_eq!(err.threshold, 3);
    }
}
