//! Retry utilities with exponential backoff and jitter.
//!
//! General-purpose retry for async operations that may fail transiently.
//! The boot probe against the API server uses the bounded
//! [`RetryConfig::startup_probe`] ladder; watch reconnects reuse the same
//! shape with their own bounds.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Fractional jitter added on top of each delay (0.1 = up to +10%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// The boot-time readiness ladder: 1s initial delay, doubling, +10%
    /// jitter, five attempts. Exhausting it is startup-fatal.
    pub fn startup_probe() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted if set.
///
/// # Returns
/// The result of the operation, or the last error once attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered = jittered_delay(delay, config.jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Stretch a delay by a random factor in `[1, 1 + jitter]`.
pub fn jittered_delay(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0..1.0 + jitter);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_startup_probe_shape() {
        let config = RetryConfig::startup_probe();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jittered_delay(base, 0.1);
            assert!(d >= base);
            assert!(d <= Duration::from_secs_f64(11.0));
        }
        assert_eq!(jittered_delay(base, 0.0), base);
    }
}
