use std::time::Duration;

/// Exponential backoff parameters.
///
/// `max_attempts` bounds in-process retries (`retry_with_backoff`) and doubles as
/// the attempt ceiling when the config describes a topic's redelivery policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2,
            jitter_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt - 1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_multiplier
            .max(1)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// `base_delay(attempt)` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter_factor.clamp(0.0, 1.0);

        let scale = if jitter > 0.0 {
            rand::random_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };

        Duration::from_millis((base * scale) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_until_capped() {
        let config = RetryConfig::default();

        assert_eq!(config.base_delay(1), Duration::from_secs(1));
        assert_eq!(config.base_delay(2), Duration::from_secs(2));
        assert_eq!(config.base_delay(5), Duration::from_secs(16));
        assert_eq!(config.base_delay(6), Duration::from_secs(30));
        assert_eq!(config.base_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn backoff_stays_inside_jitter_window() {
        let config = RetryConfig::default();

        for _ in 0..200 {
            let delay = config.backoff(2).as_millis();
            assert!((1_000..=3_000).contains(&delay), "delay {delay}ms");
        }
    }
}
