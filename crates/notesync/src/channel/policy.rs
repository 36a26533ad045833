use std::time::Duration;

/// Exponential backoff bookkeeping for the channel.
///
/// `attempt` counts reconnections scheduled since the last successful open.
/// The delay before attempt `n` (1-indexed) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Claims the next attempt, returning its number and delay, or `None` once
    /// `max_attempts` have been used.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.delay_for(self.attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1000), 5);
        let delays: Vec<(u32, Duration)> = std::iter::from_fn(|| policy.next_attempt()).collect();

        assert_eq!(
            delays,
            [
                (1, Duration::from_millis(1000)),
                (2, Duration::from_millis(2000)),
                (3, Duration::from_millis(4000)),
                (4, Duration::from_millis(8000)),
                (5, Duration::from_millis(16000)),
            ]
        );
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_attempt(), None);
    }

    #[test]
    fn reset_restarts_at_first_delay() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(200), 3);
        policy.next_attempt();
        policy.next_attempt();
        policy.reset();

        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_attempt(), Some((1, Duration::from_millis(200))));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), u32::MAX);
        assert_eq!(policy.delay_for(64), Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn zero_max_attempts_never_reconnects() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(10), 0);
        assert_eq!(policy.next_attempt(), None);
    }
}
