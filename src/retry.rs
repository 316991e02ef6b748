use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff schedule for calls that may transiently fail.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, counting the first try.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; later delays grow geometrically.
    pub initial_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    fn delay_after(&self, failed_attempt: u32) -> Duration {
        let ms = self.initial_delay.as_millis() as f64
            * self
                .backoff_multiplier
                .powi(failed_attempt.saturating_sub(1) as i32);
        Duration::from_millis(ms as u64).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, the predicate declines a retry, or the
/// attempt budget runs out. Between attempts the config's geometric delay
/// schedule is awaited.
///
/// The predicate sees each error before any retry is scheduled; returning
/// false fails the call immediately with that error.
///
/// # Panics
/// Panics if `config.max_attempts` is 0.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    assert!(
        config.max_attempts >= 1,
        "RetryConfig.max_attempts must be >= 1, got {}",
        config.max_attempts
    );

    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "{}: succeeded on attempt {}/{}",
                        operation_name, attempt, config.max_attempts
                    );
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                debug!("{}: not retryable, failing now: {}", operation_name, e);
                return Err(e);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    "{}: giving up after {} attempt(s), last error: {}",
                    operation_name, attempt, e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_after(attempt);
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    operation_name, attempt, config.max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
