//! Bounded retry with fixed or exponential back-off for weather requests.
//!
//! [`retry_with_backoff`] drives one city's attempts strictly in sequence.
//! Terminal failures (see [`FetchFailure::is_retryable`]) end the loop at
//! once; retryable ones are retried until `max_attempts` have been made.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use wxpipe_core::{BackoffStrategy, PipelineSettings};

use crate::error::FetchFailure;

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Never below 1.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Growth per retry for [`BackoffStrategy::Exponential`].
    pub factor: f64,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.75, 1.25)`.
    pub jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        let backoff = &settings.backoff;
        Self {
            max_attempts: settings.retry_attempts.max(1),
            strategy: backoff.strategy,
            base_delay: Duration::from_millis(backoff.base_delay_ms),
            factor: backoff.factor,
            max_delay: Duration::from_millis(backoff.max_delay_ms),
            jitter: backoff.jitter,
        }
    }

    /// A policy that retries immediately. Handy for tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::ZERO,
            factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after the `attempt`-th failed attempt (1-based), before
    /// jitter.
    ///
    /// | Strategy      | Delay                                  |
    /// |---------------|----------------------------------------|
    /// | `fixed`       | `base_delay`                           |
    /// | `exponential` | `base_delay × factor^(attempt − 1)`    |
    ///
    /// Both are capped at `max_delay`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_secs_f64() * 1_000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1_000.0;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt.saturating_sub(1).min(64)).unwrap_or(64);
                base_ms * self.factor.powi(exponent)
            }
        };
        let capped_ms = if raw_ms.is_finite() {
            raw_ms.min(max_ms)
        } else {
            max_ms
        };
        Duration::from_secs_f64(capped_ms.max(0.0) / 1_000.0)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(rand::random::<f64>() * 0.5 + 0.75)
        } else {
            delay
        }
    }
}

/// The failure that ended a retry loop, with the number of attempts made.
#[derive(Debug)]
pub(crate) struct Exhausted {
    pub failure: FetchFailure,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails terminally, or `policy`'s
/// attempt budget is spent. `operation` receives the 1-based attempt number;
/// a success comes back with the number of attempts it took.
///
/// A `Retry-After` hint on a rate-limited response raises the next delay up
/// to `max_delay`. No attempt starts after `deadline`, and a back-off that
/// would run past it ends the loop with the last failure.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut operation: F,
) -> Result<(T, u32), Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchFailure>>,
{
    let mut attempt = 0u32;
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Exhausted {
                failure: FetchFailure::DeadlineExceeded,
                attempts: attempt,
            });
        }

        attempt += 1;
        let failure = match operation(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(failure) => failure,
        };

        if !failure.is_retryable() || attempt >= policy.max_attempts {
            return Err(Exhausted {
                failure,
                attempts: attempt,
            });
        }

        let mut delay = policy.jittered(policy.delay_after(attempt));
        if let FetchFailure::RateLimited {
            retry_after_secs: Some(secs),
        } = &failure
        {
            delay = delay.max(Duration::from_secs(*secs).min(policy.max_delay));
        }

        if deadline.is_some_and(|d| Instant::now() + delay >= d) {
            tracing::warn!(
                attempt,
                error = %failure,
                "back-off would pass the run deadline; giving up"
            );
            return Err(Exhausted {
                failure,
                attempts: attempt,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        tracing::warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms,
            error = %failure,
            "transient weather API error; retrying after back-off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn exponential(base_ms: u64, factor: f64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(base_ms),
            factor,
            max_delay: Duration::from_millis(max_ms),
            jitter: false,
        }
    }

    #[test]
    fn exponential_delay_grows_and_caps() {
        let policy = exponential(100, 2.0, 500);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(60), Duration::from_millis(500));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            ..exponential(250, 3.0, 10_000)
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(7), Duration::from_millis(250));
    }

    #[test]
    fn policy_from_settings_keeps_total_attempts() {
        let settings = PipelineSettings {
            retry_attempts: 4,
            ..PipelineSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!(policy.jitter);
    }

    async fn count_calls(
        policy: &RetryPolicy,
        deadline: Option<Instant>,
        make: fn(u32) -> Result<u32, FetchFailure>,
    ) -> (Result<(u32, u32), Exhausted>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = retry_with_backoff(policy, deadline, move |attempt| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                make(attempt)
            }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    fn server_error(_attempt: u32) -> Result<u32, FetchFailure> {
        Err(FetchFailure::ServerError { status: 500 })
    }

    #[tokio::test]
    async fn succeeds_immediately_on_first_try() {
        let (result, calls) = count_calls(&RetryPolicy::immediate(3), None, |_| Ok(42)).await;
        assert_eq!(result.unwrap(), (42, 1));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retryable_failure_uses_exactly_max_attempts() {
        for n in 1..=4 {
            let (result, calls) = count_calls(&RetryPolicy::immediate(n), None, |_| {
                Err(FetchFailure::ServerError { status: 503 })
            })
            .await;
            let err = result.unwrap_err();
            assert_eq!(calls, n, "max_attempts={n}");
            assert_eq!(err.attempts, n);
            assert!(matches!(err.failure, FetchFailure::ServerError { .. }));
        }
    }

    #[tokio::test]
    async fn terminal_failure_stops_after_one_attempt() {
        let (result, calls) = count_calls(&RetryPolicy::immediate(5), None, |_| {
            Err(FetchFailure::Rejected {
                status: 404,
                message: "city not found".to_owned(),
            })
        })
        .await;
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let (result, calls) = count_calls(&RetryPolicy::immediate(3), None, |attempt| {
            if attempt < 3 {
                Err(FetchFailure::RateLimited {
                    retry_after_secs: None,
                })
            } else {
                Ok(attempt)
            }
        })
        .await;
        let (value, attempts) = result.unwrap();
        assert_eq!(value, 3);
        assert_eq!(attempts, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn passed_deadline_prevents_any_attempt() {
        let deadline = Instant::now();
        let (result, calls) =
            count_calls(&RetryPolicy::immediate(3), Some(deadline), |_| Ok(1)).await;
        let err = result.unwrap_err();
        assert_eq!(calls, 0);
        assert_eq!(err.attempts, 0);
        assert!(matches!(err.failure, FetchFailure::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_deadline_returns_last_failure() {
        let policy = RetryPolicy {
            max_attempts: 5,
            ..exponential(10_000, 2.0, 60_000)
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        let (result, calls) = count_calls(&policy, Some(deadline), server_error).await;
        let err = result.unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err.failure, FetchFailure::ServerError { status: 500 }));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..exponential(1_000, 2.0, 10_000)
        };
        let started = Instant::now();
        let (_, calls) = count_calls(&policy, None, server_error).await;
        assert_eq!(calls, 3);
        // 1 s after the first failure, 2 s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
