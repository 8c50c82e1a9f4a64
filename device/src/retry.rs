use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Try again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; pause before the counter starts over.
    Pause(Duration),
}

/// Blind reconnect policy: fixed delay between attempts, then a long pause
/// once `attempts` consecutive failures pile up.
#[derive(Debug, Clone)]
pub struct FixedRetry {
    attempts: u32,
    delay: Duration,
    pause: Duration,
    failures: u32,
}

impl FixedRetry {
    pub fn new(attempts: u32, delay: Duration, pause: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            pause,
            failures: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    pub fn on_failure(&mut self) -> RetryStep {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.attempts {
            self.failures = 0;
            RetryStep::Pause(self.pause)
        } else {
            RetryStep::Retry {
                attempt: self.failures,
                delay: self.delay,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pauses_after_exhausting_attempts() {
        let mut retry = FixedRetry::new(3, Duration::from_secs(5), Duration::from_secs(30));

        assert_eq!(
            retry.on_failure(),
            RetryStep::Retry {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            retry.on_failure(),
            RetryStep::Retry {
                attempt: 2,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(retry.on_failure(), RetryStep::Pause(Duration::from_secs(30)));
        assert_eq!(
            retry.on_failure(),
            RetryStep::Retry {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn success_resets_the_counter() {
        let mut retry = FixedRetry::new(2, Duration::from_secs(1), Duration::from_secs(10));

        let _ = retry.on_failure();
        retry.on_success();

        assert!(matches!(retry.on_failure(), RetryStep::Retry { attempt: 1, .. }));
    }

    #[test]
    fn single_attempt_pauses_immediately() {
        let mut retry = FixedRetry::new(0, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(retry.attempts(), 1);
        assert_eq!(retry.on_failure(), RetryStep::Pause(Duration::from_secs(10)));
    }
}
