//! Reconnect schedule.

use std::time::Duration;

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default number of consecutive failures before the long cooldown.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default cooldown after `max_attempts` consecutive failures.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Fixed-delay reconnect schedule with a periodic long cooldown.
///
/// Reconnection never gives up: after `max_attempts` consecutive failures
/// the loop waits `cooldown` instead of `delay` and starts counting again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Pause after an ordinary failed attempt.
    pub delay: Duration,
    /// Consecutive failures that trigger the cooldown.
    pub max_attempts: u32,
    /// Pause once `max_attempts` is reached.
    pub cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this long and retry, keeping the attempt count.
    Retry(Duration),
    /// Wait this long, reset the attempt count, then retry.
    Cooldown(Duration),
}

impl Backoff {
    /// How long to wait.
    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            Self::Retry(d) | Self::Cooldown(d) => d,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(delay: Duration, max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            delay,
            max_attempts,
            cooldown,
        }
    }

    /// Decide the wait after `attempt` consecutive failures (1-based).
    #[must_use]
    pub const fn after_failure(&self, attempt: u32) -> Backoff {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            Backoff::Cooldown(self.cooldown)
        } else {
            Backoff::Retry(self.delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.cooldown, Duration::from_secs(30));
    }

    #[test_case(1 => Backoff::Retry(Duration::from_secs(5)) ; "first failure")]
    #[test_case(4 => Backoff::Retry(Duration::from_secs(5)) ; "below cap")]
    #[test_case(5 => Backoff::Cooldown(Duration::from_secs(30)) ; "at cap")]
    #[test_case(9 => Backoff::Cooldown(Duration::from_secs(30)) ; "past cap")]
    fn test_after_failure(attempt: u32) -> Backoff {
        ReconnectPolicy::default().after_failure(attempt)
    }

    #[test]
    fn test_zero_max_attempts_never_cools_down() {
        let policy = ReconnectPolicy::new(Duration::from_millis(10), 0, Duration::from_secs(1));
        assert_eq!(policy.after_failure(100), Backoff::Retry(Duration::from_millis(10)));
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(Backoff::Retry(Duration::from_secs(1)).delay(), Duration::from_secs(1));
        assert_eq!(Backoff::Cooldown(Duration::from_secs(7)).delay(), Duration::from_secs(7));
    }
}
