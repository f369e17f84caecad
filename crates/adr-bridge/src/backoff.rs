//! Exponential reconnect delay for the status subscription.

use std::time::Duration;

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based); attempt 0 is
    /// immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }
}
