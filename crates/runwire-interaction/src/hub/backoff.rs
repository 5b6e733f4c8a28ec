//! Reconnect delays: `min(base * 2^attempt, max)`, optionally with full jitter.

use rand::Rng;
use runwire_core::config::ReconnectSettings;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Always return the capped exponential delay.
    None,
    /// Return a random delay in `[0, capped_delay]`.
    Full,
}

/// Exponential backoff sequence bounded by a maximum number of delays.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter: Jitter::None,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        let jitter = if settings.jitter {
            Jitter::Full
        } else {
            Jitter::None
        };
        Self::new(settings.base_delay(), settings.max_delay(), settings.max_attempts)
            .with_jitter(jitter)
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Next delay, or `None` once `max_attempts` delays have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let capped_ms = capped_ms.min(u64::MAX as u128) as u64;

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Full => rand::thread_rng().gen_range(0..=capped_ms),
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    /// Delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_with_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 7);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn test_from_default_settings() {
        let mut backoff = ExponentialBackoff::from_settings(&ReconnectSettings::default());
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn test_full_jitter_stays_within_cap() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(250),
            20,
        )
        .with_jitter(Jitter::Full);
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_millis(250));
        }
        assert_eq!(backoff.attempt(), 20);
    }

    #[test]
    fn test_zero_attempts_is_exhausted() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(2), 0);
        assert_eq!(backoff.next_delay(), None);
    }
}
