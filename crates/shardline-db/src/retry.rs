//! Exponential backoff with jitter.
//!
//! The delay before retry `n` (zero-based) is `base * 2^n`, perturbed by up
//! to +/-25% and capped at `max_delay_ms`. Sleeps go through
//! [`tokio::time::sleep`] so a retrying task never blocks the runtime.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum relative deviation applied to each backoff delay.
pub const JITTER_FRACTION: f64 = 0.25;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Default delay ceiling in milliseconds.
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

/// Retry policy for one executor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Copy of this policy with a different retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Un-jittered delay before retry `attempt`: `base * 2^attempt`, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Delay before retry `attempt` with a caller-supplied jitter sample.
    ///
    /// `jitter` is clamped to `[-1.0, 1.0]` and scaled by
    /// [`JITTER_FRACTION`], so `0.0` yields the plain exponential delay.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let offset = base * JITTER_FRACTION * jitter.clamp(-1.0, 1.0);
        let millis = (base + offset).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(millis.round() as u64)
    }

    /// Delay before retry `attempt` with a random jitter sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, jitter)
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// retry budget is spent.
///
/// `operation` receives the zero-based attempt number. On exhaustion the
/// error of the final attempt is returned unchanged.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once
/// `config.max_retries` retries have failed.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = config.next_delay(attempt);
                warn!(
                    attempt = attempt.saturating_add(1),
                    max_retries = config.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn base_delay_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(800));
        assert_eq!(config.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(config.base_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 400,
            max_delay_ms: 10_000,
        };
        assert_eq!(config.delay_with_jitter(0, 1.0), Duration::from_millis(500));
        assert_eq!(config.delay_with_jitter(0, -1.0), Duration::from_millis(300));
        assert_eq!(config.delay_with_jitter(0, 0.0), Duration::from_millis(400));
        // Out-of-range samples are clamped.
        assert_eq!(config.delay_with_jitter(0, 7.0), Duration::from_millis(500));

        for attempt in 0..5 {
            let d = config.next_delay(attempt).as_millis();
            let base = config.base_delay(attempt).as_millis();
            assert!(d >= base * 3 / 4 && d <= base * 5 / 4, "{d} vs {base}");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 1_000,
        };
        assert_eq!(config.delay_with_jitter(2, 1.0), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();
        let result: Result<u32, String> = retry_with_backoff(
            &config,
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &RetryConfig::default(),
            |_| false,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("constraint".to_owned()) }
            },
        )
        .await;
        assert_eq!(result, Err("constraint".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().with_max_retries(2);
        let result: Result<(), String> = retry_with_backoff(
            &config,
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {attempt}")) }
            },
        )
        .await;
        assert_eq!(result, Err("failure 2".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
