//! Retry schedule for the initial registry connect, and a log throttle for
//! repeated "still unreachable" warnings.

use std::time::Duration;

use tokio::time::Instant;

use rn_domain::config::{MaxWait, RegistryConfig};

/// Fixed-interval retry schedule bounded by a [`MaxWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub poll_interval: Duration,
    /// Total time the schedule may keep retrying.
    pub max_wait: MaxWait,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RegistryConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            max_wait: cfg.max_wait(),
        }
    }

    /// Delay before the next attempt, given the time elapsed since the first
    /// one.  `None` means give up.  The delay never carries the schedule past
    /// its deadline.
    pub fn next_delay(&self, elapsed: Duration) -> Option<Duration> {
        match self.max_wait {
            MaxWait::Forever => Some(self.poll_interval),
            MaxWait::Once => None,
            MaxWait::Within(limit) if elapsed >= limit => None,
            MaxWait::Within(limit) => Some(self.poll_interval.min(limit - elapsed)),
        }
    }
}

/// Lets one log line through per window and counts the rest.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(n)` when a line may be emitted now, `n` being how many were
    /// suppressed since the previous emission.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.window => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.poll_interval, Duration::from_millis(500));
        assert_eq!(p.max_wait, MaxWait::Forever);
    }

    #[test]
    fn forever_never_gives_up() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.next_delay(Duration::from_secs(1_000_000)),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn once_gives_up_immediately() {
        let p = RetryPolicy {
            poll_interval: Duration::from_millis(500),
            max_wait: MaxWait::Once,
        };
        assert_eq!(p.next_delay(Duration::ZERO), None);
    }

    #[test]
    fn bounded_wait_clamps_last_delay() {
        let p = RetryPolicy {
            poll_interval: Duration::from_millis(500),
            max_wait: MaxWait::Within(Duration::from_millis(1200)),
        };
        assert_eq!(p.next_delay(Duration::ZERO), Some(Duration::from_millis(500)));
        assert_eq!(
            p.next_delay(Duration::from_millis(1000)),
            Some(Duration::from_millis(200))
        );
        assert_eq!(p.next_delay(Duration::from_millis(1200)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_allows_one_per_window() {
        let mut t = LogThrottle::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(t.check(start), Some(0));
        for s in 1..60 {
            assert_eq!(t.check(start + Duration::from_secs(s)), None);
        }
        assert_eq!(t.check(start + Duration::from_secs(60)), Some(59));
        assert_eq!(t.check(start + Duration::from_secs(61)), None);
    }
}
