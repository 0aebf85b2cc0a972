//! Retry and backoff functionality shared by the poller, the checkpoint
//! stores and the publisher

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff};
pub use error::RetryError;

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt (None for infinite)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// The exponential backoff described by this configuration
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_backoff, self.max_backoff).with_jitter(self.jitter_factor)
    }

    /// Whether `retries` retries have used up the budget
    pub fn exhausted(&self, retries: u32) -> bool {
        self.max_retries.is_some_and(|max| retries >= max)
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `true` when the full delay elapsed. A dropped shutdown sender is
/// treated as "never shutting down".
pub async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return false,
                Ok(()) => continue,
                Err(_) => {
                    (&mut sleep).await;
                    return true;
                }
            }
        }
    }
}

/// Helper for retrying operations with backoff.
///
/// An attempt that is already running is always awaited to completion; only
/// the wait between attempts observes shutdown.
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation on every error
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display + fmt::Debug,
    {
        self.retry_if(operation, |_| true, shutdown).await
    }

    /// Retry an operation while `is_retryable` accepts the error
    pub async fn retry_if<F, Fut, T, E, P>(
        &mut self,
        mut operation: F,
        is_retryable: P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display + fmt::Debug,
        P: Fn(&E) -> bool,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let error = match operation().await {
                Ok(value) => {
                    debug!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                warn!(attempts = self.attempts, error = %error, "Operation failed with non-retryable error");
                return Err(RetryError::Rejected(error));
            }

            let retries_so_far = self.attempts - 1;
            if self.config.exhausted(retries_so_far) {
                warn!(
                    attempts = self.attempts,
                    error = %error,
                    "Maximum retry attempts exceeded"
                );
                return Err(RetryError::MaxRetriesExceeded {
                    attempts: self.attempts,
                    last_error: error,
                });
            }

            let delay = self.backoff.next_delay(retries_so_far);
            warn!(
                attempt = self.attempts,
                delay_ms = ?delay.as_millis(),
                error = %error,
                "Operation failed, retrying after delay"
            );

            if !sleep_unless_shutdown(delay, shutdown).await {
                debug!("Retry interrupted by shutdown signal");
                return Err(RetryError::Interrupted);
            }
        }
    }

    /// Reset the retry counter
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
