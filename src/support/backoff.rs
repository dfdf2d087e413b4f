//! Retry schedule for transaction-critical requests.
//!
//! StartTransaction and StopTransaction carry non-idempotent effects, so their
//! retries are bounded and spaced out instead of hammered: the delay before
//! attempt n+1 is n times the base interval.

/// Bounded, linearly growing retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Base interval in seconds between attempts.
    pub retry_interval_s: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_interval_s: u64) -> Self {
        Self {
            max_attempts,
            retry_interval_s,
        }
    }

    /// Delay in milliseconds before the attempt following `attempts` completed
    /// tries, or `None` once the budget is exhausted.
    pub fn delay_after_ms(&self, attempts: u32) -> Option<u64> {
        if attempts >= self.max_attempts {
            return None;
        }
        Some(u64::from(attempts) * self.retry_interval_s * 1000)
    }

    /// Whether another attempt is allowed after `attempts` completed tries.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval_s: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_linearly_then_exhausts() {
        let policy = RetryPolicy::new(3, 10);
        assert_eq!(policy.delay_after_ms(0), Some(0));
        assert_eq!(policy.delay_after_ms(1), Some(10_000));
        assert_eq!(policy.delay_after_ms(2), Some(20_000));
        assert_eq!(policy.delay_after_ms(3), None);
    }

    #[test]
    fn allows_tracks_budget() {
        let policy = RetryPolicy::new(1, 60);
        assert!(policy.allows(0));
        assert!(!policy.allows(1));
    }
}
