use std::thread;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Interval grows by one base interval per attempt.
    Linear,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            backoff: Backoff::Linear,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Linear => self.interval.saturating_mul(attempt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Runs `operation` until `is_success` accepts its value or the attempts run
/// out, sleeping between attempts. The last value is returned either way.
pub fn retry<T, F, P>(label: &str, policy: RetryPolicy, mut operation: F, is_success: P) -> RetryOutcome<T>
where
    F: FnMut(u32) -> T,
    P: Fn(&T) -> bool,
{
    let mut attempt = 1;
    loop {
        let value = operation(attempt);
        if is_success(&value) {
            return RetryOutcome {
                value,
                attempts: attempt,
                succeeded: true,
            };
        }
        if attempt >= policy.max_attempts {
            return RetryOutcome {
                value,
                attempts: attempt,
                succeeded: false,
            };
        }

        let delay = policy.delay_after(attempt);
        debug!(label, attempt, delay_secs = delay.as_secs(), "retrying");
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        attempt = attempt.saturating_add(1);
    }
}
