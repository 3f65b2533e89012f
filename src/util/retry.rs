use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};

/// Errors that know whether another attempt could succeed.
pub(crate) trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retries retryable errors up to `max_attempts` total attempts, waiting
/// `delay` between them. Non-retryable errors are forwarded immediately.
pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl<E: Retryable> ErrorHandler<E> for FixedCountWithDelayStrategy {
    type OutError = E;

    fn handle(&mut self, attempt: usize, e: E) -> RetryPolicy<E> {
        if attempt >= self.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        if self.delay.is_zero() {
            RetryPolicy::Repeat
        } else {
            RetryPolicy::WaitRetry(self.delay)
        }
    }
}
