//! Retry logic with exponential backoff
//!
//! Retry support for transient failures:
//! - Exponential backoff to avoid hammering an already struggling host
//! - Full jitter so concurrent retries do not synchronize
//! - Integration with error types via a caller-supplied retriability check
//!
//! The HTTP fabric layers `Retry-After` handling on top of this; callers
//! that need the raw schedule use [`RetryConfig::backoff_delay`].

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,

    /// Base delay; attempt n waits up to `base × multiplier^n`
    pub base_delay: Duration,

    /// Ceiling on any single delay
    pub max_delay: Duration,

    /// Backoff multiplier (typically 2.0)
    pub multiplier: f64,

    /// Full jitter: each delay is uniform in [0, computed delay]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4, // 1 try + 3 retries
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Build from the engine's HTTP settings.
    pub fn from_http(max_retries: u32, base_seconds: f64, max_seconds: f64) -> Self {
        Self {
            max_attempts: max_retries + 1,
            base_delay: Duration::from_secs_f64(base_seconds),
            max_delay: Duration::from_secs_f64(max_seconds),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Delay before retrying after attempt number `attempt` (0-based).
    ///
    /// Applies the exponential schedule, the cap, and full jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        if self.jitter {
            full_jitter(Duration::from_secs_f64(capped))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
///
/// * `operation` - the operation to retry (closure returning a future)
/// * `config` - retry configuration
/// * `is_retriable` - whether an error is worth retrying
///
/// # Behavior
///
/// - Attempts the operation up to `config.max_attempts` times
/// - Retriable failures wait `backoff_delay(attempt)` before the next try
/// - Non-retriable failures and budget exhaustion return the error
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    mut operation: F,
    config: RetryConfig,
    is_retriable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return Ok(result);
            }
            Err(e) => {
                let should_retry = attempt + 1 < config.max_attempts && is_retriable(&e);
                if !should_retry {
                    if attempt + 1 >= config.max_attempts {
                        debug!("Retry budget ({}) exhausted", config.max_attempts);
                    } else {
                        debug!("Error not retriable, giving up: {}", e);
                    }
                    return Err(e);
                }

                let delay = config.backoff_delay(attempt);
                debug!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt + 1,
                    config.max_attempts,
                    e,
                    delay
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Full jitter: uniform random delay in [0, max].
fn full_jitter(max: Duration) -> Duration {
    use rand::Rng;
    if max.is_zero() {
        return max;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::from_secs_f64(max.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let result = retry_with_backoff(
            || async { Ok::<_, String>(42) },
            RetryConfig::default(),
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            no_jitter(4),
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("always fails")
                }
            },
            no_jitter(3),
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_stops_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("fatal")
                }
            },
            no_jitter(5),
            |_| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_schedule_without_jitter() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        // Capped
        assert_eq!(config.backoff_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_full_jitter_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..5 {
            let ceiling = RetryConfig {
                jitter: false,
                ..config.clone()
            }
            .backoff_delay(attempt);
            for _ in 0..50 {
                let d = config.backoff_delay(attempt);
                assert!(d <= ceiling);
            }
        }
    }

    #[test]
    fn test_from_http() {
        let config = RetryConfig::from_http(3, 0.5, 10.0);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(config.jitter);
    }
}
