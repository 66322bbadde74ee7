//! Retry policies for operations that may succeed later, such as scanning
//! for records the host has not allocated yet.

use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::shutdown::ShutdownSignal;

/// Decides whether and when to try again.
pub trait RetryStrategy: Send + Sync {
    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based)
    /// just failed. `None` means give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// A bounded number of attempts with a constant pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }
}

/// Single attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Outcome of [`retry_with`].
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    /// Every allowed attempt failed; carries the last error.
    Exhausted(crate::error::Error),
    /// Shutdown was signalled while waiting between attempts.
    Cancelled,
}

/// Run `op` under `strategy`. Waits are interruptible by `shutdown`.
///
/// Non-recoverable errors end the loop immediately.
pub fn retry_with<T, S, F>(strategy: &S, shutdown: &ShutdownSignal, mut op: F) -> RetryOutcome<T>
where
    S: RetryStrategy + ?Sized,
    F: FnMut(u32) -> Result<T>,
{
    let mut attempt = 1u32;
    loop {
        if shutdown.is_shutdown() {
            return RetryOutcome::Cancelled;
        }

        let err = match op(attempt) {
            Ok(value) => return RetryOutcome::Succeeded(value),
            Err(e) if !e.is_recoverable() => return RetryOutcome::Exhausted(e),
            Err(e) => e,
        };

        let Some(delay) = strategy.next_delay(attempt) else {
            return RetryOutcome::Exhausted(err);
        };
        debug!("Attempt {} failed ({}), retrying in {:?}", attempt, err, delay);

        if shutdown.wait(delay) {
            return RetryOutcome::Cancelled;
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_fixed_delay_gives_up_after_max() {
        let policy = FixedDelay::new(3, Duration::from_secs(5));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_retry_until_success() {
        let shutdown = ShutdownSignal::new();
        let outcome = retry_with(&FixedDelay::new(5, Duration::ZERO), &shutdown, |attempt| {
            if attempt < 3 {
                Err(Error::PatternNotFound("SpEffectParam".into()))
            } else {
                Ok(attempt)
            }
        });
        assert!(matches!(outcome, RetryOutcome::Succeeded(3)));
    }

    #[test]
    fn test_retry_exhausted_keeps_last_error() {
        let shutdown = ShutdownSignal::new();
        let mut calls = 0;
        let outcome: RetryOutcome<()> =
            retry_with(&FixedDelay::new(2, Duration::ZERO), &shutdown, |_| {
                calls += 1;
                Err(Error::PatternNotFound("GameAreaParam".into()))
            });
        assert!(matches!(outcome, RetryOutcome::Exhausted(Error::PatternNotFound(_))));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_schema_error_stops_immediately() {
        let shutdown = ShutdownSignal::new();
        let mut calls = 0;
        let outcome: RetryOutcome<()> =
            retry_with(&FixedDelay::new(5, Duration::ZERO), &shutdown, |_| {
                calls += 1;
                Err(Error::Schema("length mismatch".into()))
            });
        assert!(matches!(outcome, RetryOutcome::Exhausted(Error::Schema(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_shutdown_cancels() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let outcome: RetryOutcome<()> = retry_with(&NoRetry, &shutdown, |_| Ok(()));
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }
}
