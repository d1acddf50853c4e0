//! Client-side polling cadence for `create --wait`.

use std::time::Duration;

/// How often a waiting client re-reads instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Emit one progress mark every this many polls.
    pub progress_every: u32,
    /// `None` waits until a terminal answer arrives.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            progress_every: 10,
            timeout: None,
        }
    }
}

impl PollPolicy {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether poll number `poll` (1-based) should print a progress mark.
    pub fn is_progress_tick(&self, poll: u32) -> bool {
        self.progress_every > 0 && poll > 0 && poll % self.progress_every == 0
    }

    pub fn expired(&self, elapsed: Duration) -> bool {
        self.timeout.is_some_and(|limit| elapsed >= limit)
    }

    /// Time left before the cap; `None` when unbounded.
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.timeout.map(|limit| limit.saturating_sub(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_cadence() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(100));
        assert_eq!(policy.progress_every, 10);
        assert!(policy.timeout.is_none());
    }

    #[test]
    fn progress_every_tenth_poll() {
        let policy = PollPolicy::default();
        let ticks: Vec<u32> = (1..=30).filter(|p| policy.is_progress_tick(*p)).collect();
        assert_eq!(ticks, vec![10, 20, 30]);
        assert!(!policy.is_progress_tick(0));
    }

    #[test]
    fn unbounded_never_expires() {
        let policy = PollPolicy::default();
        assert!(!policy.expired(Duration::from_secs(86_400)));

        let policy = policy.with_timeout(Some(Duration::from_secs(2)));
        assert!(!policy.expired(Duration::from_millis(1999)));
        assert!(policy.expired(Duration::from_secs(2)));
    }

    #[test]
    fn remaining_time_shrinks_to_zero() {
        assert_eq!(PollPolicy::default().remaining(Duration::from_secs(5)), None);

        let policy = PollPolicy::default().with_timeout(Some(Duration::from_secs(2)));
        assert_eq!(
            policy.remaining(Duration::from_millis(500)),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(policy.remaining(Duration::from_secs(3)), Some(Duration::ZERO));
    }
}
