//! Classified retry with configurable backoff.
//!
//! The handler wraps one fallible async operation. Failures are classified by
//! substring matching on the error message: auth and config errors never
//! retry, transient network errors always do, and unknown errors default to
//! retryable. Sleeps between attempts honour the abort controller.

use crate::abort::AbortController;
use crate::errors::AbortedError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Retry configuration for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Context passed to the `on_retry` callback before each sleep.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// 1-based number of the attempt that just failed.
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub last_error: &'a str,
    /// Every delay used so far, including the upcoming one (last element).
    pub delays: &'a [Duration],
}

/// Error-message substrings that must never be retried.
const NON_RETRYABLE: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "enoent",
    "no such file",
    "yaml",
    "parse error",
    "invalid config",
];

/// Error-message substrings that identify transient failures.
const RETRYABLE: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "econnrefused",
    "econnreset",
    "etimedout",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Classify an error message. Stateless; case-insensitive.
///
/// A non-retryable match wins over a retryable one; unmatched messages
/// default to retryable.
pub fn should_retry(message: &str) -> bool {
    let lower = message.to_lowercase();
    if NON_RETRYABLE.iter().any(|needle| lower.contains(needle)) {
        return false;
    }
    if RETRYABLE.iter().any(|needle| lower.contains(needle)) {
        return true;
    }
    true
}

/// Delay before the retry following the `retry_index`-th failure (0-based).
pub fn delay_for_attempt(policy: &RetryPolicy, retry_index: u32) -> Duration {
    let initial = policy.initial_delay_ms;
    let raw = match policy.backoff {
        Backoff::Fixed => initial,
        Backoff::Linear => initial.saturating_mul(u64::from(retry_index) + 1),
        Backoff::Exponential => {
            let factor = 2u64.checked_pow(retry_index).unwrap_or(u64::MAX);
            initial.saturating_mul(factor)
        }
    };
    Duration::from_millis(raw.min(policy.max_delay_ms))
}

/// Render a delay for humans: "750ms", "2.5s", "1.5m".
pub fn format_delay(delay: Duration) -> String {
    let ms = delay.as_millis() as u64;
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}

/// Run `operation` up to `policy.max_attempts` times.
///
/// `operation` receives the 1-based attempt number. `on_retry` fires before
/// each sleep — exactly `attempts - 1` times on eventual success and
/// `max_attempts - 1` times on total failure, never on first-attempt success.
/// Non-retryable failures rethrow immediately. Sleeps resolve as
/// `AbortedError` when `abort` fires.
pub async fn execute_with_retry<T, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
    abort: Option<&AbortController>,
    mut on_retry: impl FnMut(&RetryNotice<'_>),
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays: Vec<Duration> = Vec::new();

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let message = error.to_string();
                if error.is::<AbortedError>() {
                    return Err(error);
                }
                if !should_retry(&message) || attempt == max_attempts {
                    return Err(error);
                }

                let delay = delay_for_attempt(policy, attempt - 1);
                delays.push(delay);
                debug!(
                    attempt,
                    max_attempts,
                    delay = %format_delay(delay),
                    "retrying after failure: {message}"
                );
                on_retry(&RetryNotice {
                    attempt_number: attempt,
                    max_attempts,
                    last_error: &message,
                    delays: &delays,
                });

                match abort {
                    Some(controller) => controller.sleep(delay).await?,
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }

    unreachable!("retry loop always returns from its final attempt")
}
