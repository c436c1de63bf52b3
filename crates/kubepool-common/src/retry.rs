//! Retry and polling utilities.
//!
//! Three shapes of waiting show up when bootstrapping a pool:
//! - `retry_with_backoff` for cloud API calls that may fail transiently
//! - `poll_attempts` for fixed-interval, fixed-count waits (coordination keys)
//! - `poll_until_deadline` for fixed-interval, wall-clock waits (instances)
//!
//! The polling helpers log progress on every attempt since a single wait
//! can run for tens of minutes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::Result;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
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
/// `should_retry` decides whether a given error is worth another attempt;
/// permanent failures are returned immediately.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: R,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Poll a condition exactly `max_attempts` times at a fixed interval.
///
/// `check` returns `Ok(Some(value))` when ready, `Ok(None)` to keep waiting,
/// or `Err` to stop immediately. There is no sleep after the final attempt.
///
/// # Returns
/// * `Ok(Some(value))` - The condition was met
/// * `Ok(None)` - All attempts were used without the condition being met
/// * `Err(e)` - `check` failed fatally
pub async fn poll_attempts<T, F, Fut>(
    description: &str,
    max_attempts: u32,
    interval: Duration,
    mut check: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();

    for attempt in 1..=max_attempts {
        if let Some(value) = check().await? {
            info!(
                target_name = %description,
                attempt,
                elapsed_secs = start.elapsed().as_secs(),
                "Wait satisfied"
            );
            return Ok(Some(value));
        }

        info!(
            target_name = %description,
            attempt,
            max_attempts,
            remaining = max_attempts - attempt,
            elapsed_secs = start.elapsed().as_secs(),
            "Still waiting"
        );

        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(None)
}

/// Poll a condition at a fixed interval until a wall-clock deadline.
///
/// Unlike [`poll_attempts`], `check` returns `(done, observed)` so the last
/// observation can be reported when the deadline passes.
///
/// # Returns
/// * `Ok(Ok(value))` - The condition was met
/// * `Ok(Err(last))` - The deadline passed; `last` is the final observation
/// * `Err(e)` - `check` failed fatally
pub async fn poll_until_deadline<T, F, Fut>(
    description: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<std::result::Result<T, T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(bool, T)>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let (done, observed) = check().await?;
        if done {
            return Ok(Ok(observed));
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            warn!(
                target_name = %description,
                attempt,
                elapsed_secs = elapsed.as_secs(),
                "Deadline passed"
            );
            return Ok(Err(observed));
        }

        info!(
            target_name = %description,
            attempt,
            elapsed_secs = elapsed.as_secs(),
            remaining_secs = (timeout - elapsed).as_secs(),
            "Still waiting"
        );
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}
