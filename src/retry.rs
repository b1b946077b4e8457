#![forbid(unsafe_code)]

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Retry policy shared by flow steps and asynchronous route delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::Fixed,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "fixed" => Some(BackoffStrategy::Fixed),
            "linear" => Some(BackoffStrategy::Linear),
            "exponential" => Some(BackoffStrategy::Exponential),
            _ => None,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-attempting after failed attempt number `attempt`
    /// (1-based: the first retry waits `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Linear => self.delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let shift = (attempt - 1).min(31);
                self.delay.saturating_mul(1u32 << shift)
            }
        }
    }
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}

/// Sleeps for a duration but aborts early if the shutdown token fires.
/// Returns `true` if shutdown occurred during the wait.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffStrategy, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff,
            delay: Duration::from_millis(delay_ms),
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = policy(BackoffStrategy::Fixed, 100);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let policy = policy(BackoffStrategy::Linear, 50);
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3), Duration::from_millis(150));
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let policy = policy(BackoffStrategy::Exponential, 25);
        assert_eq!(policy.delay_for(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for(2), Duration::from_millis(50));
        assert_eq!(policy.delay_for(4), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(20);
        for _ in 0..64 {
            let sampled = jitter_between(min, max);
            assert!(sampled >= min && sampled <= max);
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff_sleep() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(sleep_with_shutdown(Duration::from_secs(60), &shutdown).await);
    }
}
