//! Retry logic with exponential backoff for transient backend errors.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::BackendError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Callback for retry progress notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of the next attempt.
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    fn on_retry(&mut self, attempt: u32, max_attempts: u32, error: &BackendError, delay: Duration);
}

impl<F> RetryCallback for F
where
    F: FnMut(u32, u32, &BackendError, Duration),
{
    fn on_retry(&mut self, attempt: u32, max_attempts: u32, error: &BackendError, delay: Duration) {
        self(attempt, max_attempts, error, delay);
    }
}

/// Execute an operation with retry logic.
///
/// Only retryable errors are retried. A retry whose backoff would end past
/// `deadline` is not attempted; the step is reported as timed out instead.
///
/// Returns the value together with the number of attempts made, or the last
/// error and the attempt count.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    deadline: Instant,
    budget: Duration,
    mut callback: Option<&mut dyn RetryCallback>,
    mut operation: F,
) -> Result<(T, u32), (BackendError, u32)>
where
    F: FnMut() -> Result<T, BackendError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation() {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return Err((error, attempt));
        }

        let delay = config.delay_for_attempt(attempt - 1);
        if Instant::now().checked_add(delay).is_none_or(|wake| wake >= deadline) {
            log::debug!("Backoff of {:?} would pass the step deadline", delay);
            return Err((BackendError::Timeout(budget), attempt));
        }

        if let Some(cb) = callback.as_deref_mut() {
            cb.on_retry(attempt, max_attempts, &error, delay);
        }
        log::info!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt,
            max_attempts,
            error,
            delay
        );

        thread::sleep(delay);
    }
}
