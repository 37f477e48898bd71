//! Bounded retry with exponential backoff.
//!
//! Every interaction with the control store and the proxy engine goes
//! through one shared [`RetryPolicy`]: both are external services that may
//! be briefly unavailable (store locked by the harness, engine container
//! restarting). The policy is global and deliberately simple: no jitter,
//! no per-operation overrides.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Returned when an operation failed on every allowed attempt.
///
/// Carries the operation name and attempt count for diagnostics; the last
/// underlying error is preserved as the source.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {source}")]
pub struct RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    /// Name of the operation that was retried.
    pub operation: String,

    /// How many attempts were made before giving up.
    pub attempts: u32,

    /// The error from the final attempt.
    #[source]
    pub source: E,
}

/// Retry policy: attempt count and backoff base.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per operation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay; attempt `n` is followed by `base_delay * 2^(n-1)`.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit parameters.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay slept after a failed attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    /// Runs `action` until it succeeds or `max_attempts` is reached.
    ///
    /// Each failed attempt is logged at warn level with the operation name
    /// and attempt number. Between attempts the task sleeps for the
    /// exponential backoff delay.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] wrapping the final attempt's error once
    /// all attempts are spent.
    #[allow(clippy::cast_possible_truncation)] // backoff delays are far below u64::MAX ms
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        mut action: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= max_attempts => {
                    return Err(RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: error,
                    });
                },
                Err(error) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
