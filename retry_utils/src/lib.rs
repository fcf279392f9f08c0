use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How a failed remote call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableError {
    /// 429 from the provider
    RateLimit,
    /// 5xx from the provider
    ServerError,
    /// Request or connect timeout
    Timeout,
    /// Anything else is permanent
    Permanent,
}

impl RetryableError {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => RetryableError::RateLimit,
            500..=599 => RetryableError::ServerError,
            408 => RetryableError::Timeout,
            _ => RetryableError::Permanent,
        }
    }

    pub fn is_transient(self) -> bool {
        self != RetryableError::Permanent
    }
}

/// Implemented by error types that know whether they are worth retrying.
pub trait Classify {
    fn classify(&self) -> RetryableError;
}

/// Per-class delay schedule for unit-level retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 300,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// No delays, for tests and fakes.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Exponential delay for the given retry, doubled again for rate limits.
    pub fn delay_for(&self, retry: u32, class: RetryableError) -> Option<Duration> {
        let multiplier = match class {
            RetryableError::RateLimit => 2,
            RetryableError::ServerError | RetryableError::Timeout => 1,
            RetryableError::Permanent => return None,
        };
        let exp = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self
            .base_delay_ms
            .saturating_mul(exp)
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of retries.
pub async fn retry_with_backoff<F, Fut, T, E>(
    label: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let mut retry = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!("{} succeeded after {} retries", label, retry);
                }
                return Ok(value);
            }
            Err(e) => {
                let class = e.classify();
                if retry >= config.max_retries {
                    return Err(e);
                }
                let Some(delay) = config.delay_for(retry, class) else {
                    return Err(e);
                };

                warn!(
                    "⚠️ {} failed ({:?}, attempt {}/{}): {} - retrying in {}ms",
                    label,
                    class,
                    retry + 1,
                    config.max_retries + 1,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}
