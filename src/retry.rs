//! Bounded retry combinator
//!
//! Every network call in the pipeline goes through `retry` with a fixed
//! attempt budget. Errors are classified by the caller:
//! - `Retryable`: sleep `delay`, try again
//! - `Transient`: a known self-healing error; sleeps `delay` for the first
//!   `tolerated_transients` occurrences, then `escalated_delay`
//! - `Fatal`: give up immediately

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub tolerated_transients: u32,
    pub escalated_delay: Duration,
}

impl RetryPolicy {
    /// Same delay after every failure
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            tolerated_transients: u32::MAX,
            escalated_delay: delay,
        }
    }

    pub fn with_transient_escalation(mut self, tolerated: u32, escalated_delay: Duration) -> Self {
        self.tolerated_transients = tolerated;
        self.escalated_delay = escalated_delay;
        self
    }

    /// Delay before the next attempt, given the class of the last error and
    /// how many transient errors have been seen so far (including it)
    pub fn delay_after(&self, class: ErrorClass, transients_seen: u32) -> Duration {
        match class {
            ErrorClass::Transient if transients_seen > self.tolerated_transients => self.escalated_delay,
            _ => self.delay,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Debug + fmt::Display> {
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32, last: Option<E> },

    #[error("fatal error: {0}")]
    Fatal(E),
}

impl<E: fmt::Debug + fmt::Display> RetryError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } => last.as_ref(),
            RetryError::Fatal(e) => Some(e),
        }
    }
}

/// Run `op` until it succeeds, a fatal error is classified, or the attempt
/// budget is spent. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Debug + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
{
    let mut transients_seen = 0u32;
    let mut last = None;

    for attempt in 1..=policy.max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let class = classify(&e);
                if class == ErrorClass::Fatal {
                    return Err(RetryError::Fatal(e));
                }
                if class == ErrorClass::Transient {
                    transients_seen += 1;
                }
                debug!("Attempt {}/{} failed ({:?}): {}", attempt, policy.max_attempts, class, e);
                last = Some(e);

                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_after(class, transients_seen)).await;
                }
            }
        }
    }

    Err(RetryError::Exhausted { attempts: policy.max_attempts, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(500));
        let calls = Cell::new(0);

        let result: Result<u32, RetryError<String>> = retry(&policy, |_| ErrorClass::Retryable, |attempt| {
            calls.set(calls.get() + 1);
            async move {
                if attempt < 3 { Err(format!("fail {}", attempt)) } else { Ok(attempt) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        let start = tokio::time::Instant::now();

        let result: Result<(), RetryError<String>> =
            retry(&policy, |_| ErrorClass::Retryable, |_| async { Err("down".to_string()) }).await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.as_deref(), Some("down"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        // Two sleeps between three attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_immediately() {
        let policy = RetryPolicy::fixed(10, Duration::from_millis(500));
        let calls = Cell::new(0);

        let result: Result<(), RetryError<String>> = retry(&policy, |_| ErrorClass::Fatal, |_| {
            calls.set(calls.get() + 1);
            async { Err("bad request".to_string()) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_transient_escalation() {
        let policy = RetryPolicy::fixed(20, Duration::from_millis(500))
            .with_transient_escalation(5, Duration::from_millis(1000));

        assert_eq!(policy.delay_after(ErrorClass::Transient, 5), Duration::from_millis(500));
        assert_eq!(policy.delay_after(ErrorClass::Transient, 6), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(ErrorClass::Retryable, 9), Duration::from_millis(500));
    }
}
