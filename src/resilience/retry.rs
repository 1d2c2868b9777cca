//! Explicit retry policies.
//!
//! A [`RetryPolicy`] is a plain value: attempt limit, backoff schedule and a
//! predicate deciding which classified failures are worth another attempt.
//! Call sites receive one instead of wrapping functions, so the behaviour is
//! visible in configuration and directly testable.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::classify::{Classify, ErrorClassifier, Stage, StructuredError};

/// Marker produced when a cancellation token fires mid-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for StructuredError {
    fn from(_: Cancelled) -> Self {
        StructuredError::cancelled(Stage::Pipeline)
    }
}

impl From<Cancelled> for crate::error::CapabilityError {
    fn from(_: Cancelled) -> Self {
        crate::error::CapabilityError::Cancelled
    }
}

impl From<Cancelled> for crate::error::AnnotationError {
    fn from(_: Cancelled) -> Self {
        crate::error::AnnotationError::Capability(crate::error::CapabilityError::Cancelled)
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    /// `base * n` before retry `n` (1s, 2s, 3s...).
    Linear { base: Duration },
    /// `base * 2^(n-1)` before retry `n`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after `attempts_made` failed attempts.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let n = attempts_made.max(1);
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { base } => base * n,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Attempt limit, backoff schedule and retryable-failure predicate.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    retryable: fn(&StructuredError) -> bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff: Backoff,
        retryable: fn(&StructuredError) -> bool,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable,
        }
    }

    /// Exponential 1s/2s/4s for rate limits, timeouts and network errors.
    pub fn transient() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            |err| err.recoverable && err.category.is_transient(),
        )
    }

    /// Per-item policy: any recoverable, non-fatal failure is retried with a
    /// linearly increasing delay.
    pub fn per_item(max_attempts: u32, base: Duration) -> Self {
        Self::new(max_attempts, Backoff::Linear { base }, |err| {
            err.recoverable && !err.is_fatal()
        })
    }

    /// Single attempt.
    pub fn none() -> Self {
        Self::new(1, Backoff::None, |_| false)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether another attempt should follow `attempts_made` failed ones.
    pub fn should_retry(&self, error: &StructuredError, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts && (self.retryable)(error)
    }

    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        self.backoff.delay(attempts_made)
    }

    /// Runs `op` until it succeeds, the policy gives up, or `cancel` fires.
    ///
    /// `op` receives the zero-based attempt index so callers can vary the
    /// request between attempts.
    pub async fn run<T, E, F, Fut>(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Classify + fmt::Display + From<Cancelled>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(E::from(Cancelled));
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(E::from(Cancelled)),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            let classified = ErrorClassifier::classify(stage, &err);
            if !self.should_retry(&classified, attempt) {
                return Err(err);
            }

            let delay = self.delay_after(attempt);
            tracing::debug!(
                stage = %stage,
                attempt = attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(E::from(Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_backoff_schedule() {
        let backoff = Backoff::Linear {
            base: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_policy_predicate() {
        let policy = RetryPolicy::transient();
        let rate = StructuredError::new(Stage::Annotation, ErrorCategory::RateLimit, "429");
        let parse = StructuredError::new(Stage::Annotation, ErrorCategory::Parsing, "bad");
        assert!(policy.should_retry(&rate, 1));
        assert!(!policy.should_retry(&rate, 3));
        assert!(!policy.should_retry(&parse, 1));
    }

    #[test]
    fn test_per_item_policy_retries_validation_but_not_auth() {
        let policy = RetryPolicy::per_item(3, Duration::from_secs(1));
        let empty = StructuredError::new(Stage::Annotation, ErrorCategory::Validation, "0 boxes");
        let auth = StructuredError::new(Stage::Annotation, ErrorCategory::Authentication, "401");
        assert!(policy.should_retry(&empty, 1));
        assert!(!policy.should_retry(&auth, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::per_item(3, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let result: Result<u32, StructuredError> = policy
            .run(Stage::Annotation, &cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(StructuredError::new(
                            Stage::Annotation,
                            ErrorCategory::Parsing,
                            "garbled",
                        ))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of linear backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_non_retryable() {
        let policy = RetryPolicy::transient();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), StructuredError> = policy
            .run(Stage::Discovery, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StructuredError::new(
                        Stage::Discovery,
                        ErrorCategory::Authentication,
                        "bad key",
                    ))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_honours_cancellation() {
        let policy = RetryPolicy::transient();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), StructuredError> = policy
            .run(Stage::Annotation, &cancel, |_| async { Ok(()) })
            .await;

        assert!(result.expect_err("cancelled").is_cancelled());
    }
}
