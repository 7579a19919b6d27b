//! Bounded retry driver shared by the transport and parse layers.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, instrument, warn};

use crate::core::backoff::RetryPolicy;

/// A value (or error) together with the number of attempts that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Runs an operation until it succeeds, fails permanently, or the budget runs out.
#[derive(Debug, Clone, Copy)]
pub struct FixLoop {
    policy: RetryPolicy,
    label: &'static str,
}

impl FixLoop {
    pub fn new(policy: RetryPolicy, label: &'static str) -> Self {
        Self { policy, label }
    }

    /// Drive `operation`, passing the 0-based attempt index.
    ///
    /// - success returns immediately;
    /// - an error rejected by `is_transient` returns immediately, without sleeping;
    /// - otherwise sleeps `base ^ attempt_index` seconds and tries again;
    /// - after `max_attempts` invocations the last error is returned.
    #[instrument(skip_all, fields(layer = self.label, max_attempts = self.policy.max_attempts))]
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<Attempted<T>, Attempted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt_index = 0u32;
        loop {
            let attempts = attempt_index + 1;
            let err = match operation(attempt_index).await {
                Ok(value) => {
                    debug!(attempts, "attempt succeeded");
                    return Ok(Attempted { value, attempts });
                }
                Err(err) => err,
            };

            if !is_transient(&err) {
                debug!(attempts, err = %err, "permanent failure, not retrying");
                return Err(Attempted {
                    value: err,
                    attempts,
                });
            }
            if attempts >= max_attempts {
                warn!(attempts, err = %err, "retry budget exhausted");
                return Err(Attempted {
                    value: err,
                    attempts,
                });
            }

            let delay = self.policy.delay_for(attempt_index);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                err = %err,
                "transient failure, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Transient,
        Permanent,
    }

    impl Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn transient(err: &Failure) -> bool {
        *err == Failure::Transient
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_uses_whole_budget_with_growing_sleeps() {
        let calls = RefCell::new(Vec::new());
        let started = Instant::now();
        let fix = FixLoop::new(RetryPolicy::new(4, 2.0, 10), "test");

        let result: Result<Attempted<()>, _> = fix
            .run(
                |_| {
                    calls.borrow_mut().push(started.elapsed());
                    async { Err(Failure::Transient) }
                },
                transient,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.value, Failure::Transient);
        let calls = calls.into_inner();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_without_sleeping() {
        let calls = Cell::new(0u32);
        let started = Instant::now();
        let fix = FixLoop::new(RetryPolicy::new(5, 2.0, 10), "test");

        let result: Result<Attempted<()>, _> = fix
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(Failure::Permanent) }
                },
                transient,
            )
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_retries_reports_attempts() {
        let fix = FixLoop::new(RetryPolicy::new(3, 0.0, 10), "test");
        let result = fix
            .run(
                |idx| async move {
                    if idx < 2 {
                        Err(Failure::Transient)
                    } else {
                        Ok(idx)
                    }
                },
                transient,
            )
            .await
            .expect("third attempt succeeds");
        assert_eq!(
            result,
            Attempted {
                value: 2,
                attempts: 3
            }
        );
    }
}
