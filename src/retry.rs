//! Retry utilities with exponential backoff
//!
//! This module provides the shared retry machinery for unary calls and
//! stream reconnects: exponential backoff with jitter, transient-error
//! classification, and parsing of the server's 429 `RetryInfo` payload so
//! its `retryDelay` is honored over the computed backoff.
//!
//! # Examples
//!
//! ```rust,no_run
//! use gemini_client::retry::{retry_with_backoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_secs(1));
//!
//! let result = retry_with_backoff(config, || async {
//!     Ok::<_, gemini_client::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// When the server does not send a usable `RetryInfo`, back off this long.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,

    /// Random jitter applied to every delay, as a fraction of it (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay for a given zero-based attempt: exponential growth capped at
    /// `max_delay`, with ±`jitter_factor` applied.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(apply_jitter(capped_delay, self.jitter_factor))
    }

    /// Delay for an attempt when the failure carried its own retry hint:
    /// a server-provided `retryDelay` wins over the computed backoff.
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        match error {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => self.calculate_delay(attempt),
        }
    }
}

/// Applies symmetric jitter: `value ± value * factor / 2`.
pub fn apply_jitter(value_ms: f64, factor: f64) -> u64 {
    let jitter_range = value_ms * factor;
    let jitter = rand::random::<f64>() * jitter_range;
    (value_ms + jitter - jitter_range / 2.0).max(0.0) as u64
}

/// Retry an async operation with exponential backoff
///
/// Retries every failure up to `max_attempts`; use
/// [`retry_with_backoff_conditional`] to stop early on permanent errors.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_error = Some(err);
                if attempt < config.max_attempts - 1 {
                    let delay = config.calculate_delay(attempt);
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::validation("retry failed with no error")))
}

/// Retry an async operation, but only when the failure is transient.
///
/// Permanent errors (4xx, validation, auth) surface immediately. A 429 that
/// carried a `retryDelay` sleeps exactly that long instead of the computed
/// backoff.
pub async fn retry_with_backoff_conditional<F, Fut, T>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt < config.max_attempts - 1 {
                    let delay = config.delay_for_error(&err, attempt);
                    debug!(attempt, ?delay, error = %err, "retrying after transient failure");
                    last_error = Some(err);
                    sleep(delay).await;
                } else {
                    last_error = Some(err);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::validation("retry failed with no error")))
}

/// Parses `error.details[].retryDelay` out of a 429 body.
///
/// The wire format is a duration string like `"2s"` or `"1.5s"` inside the
/// detail entry whose `@type` ends in `RetryInfo`. Returns `None` when the
/// body carries no parseable delay; callers fall back to
/// [`DEFAULT_RETRY_DELAY`].
pub fn parse_retry_delay(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let details = value.get("error")?.get("details")?.as_array()?;
    for detail in details {
        let is_retry_info = detail
            .get("@type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t.ends_with("RetryInfo"));
        if !is_retry_info {
            continue;
        }
        let delay = detail.get("retryDelay")?.as_str()?;
        return parse_duration_string(delay);
    }
    None
}

/// Quota metric and id from a 429 body's `QuotaFailure` detail, when present.
pub fn parse_quota_details(body: &str) -> (Option<String>, Option<String>) {
    let Some(value) = serde_json::from_str::<serde_json::Value>(body).ok() else {
        return (None, None);
    };
    let Some(details) = value
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.as_array())
    else {
        return (None, None);
    };
    for detail in details {
        let Some(violations) = detail.get("violations").and_then(|v| v.as_array()) else {
            continue;
        };
        if let Some(violation) = violations.first() {
            let metric = violation
                .get("quotaMetric")
                .and_then(|m| m.as_str())
                .map(str::to_string);
            let id = violation
                .get("quotaId")
                .and_then(|m| m.as_str())
                .map(str::to_string);
            return (metric, id);
        }
    }
    (None, None)
}

/// Maps a non-2xx unary result to the right error variant: 429 becomes
/// [`Error::RateLimited`] with the honored (or fallback) delay, anything
/// else stays [`Error::Http`].
pub fn classify_http_error(error: Error) -> Error {
    match error {
        Error::Http { status: 429, body, .. } => {
            let retry_after = parse_retry_delay(&body).unwrap_or(DEFAULT_RETRY_DELAY);
            let (quota_metric, quota_id) = parse_quota_details(&body);
            Error::RateLimited {
                retry_after,
                quota_metric,
                quota_id,
            }
        }
        other => other,
    }
}

fn parse_duration_string(s: &str) -> Option<Duration> {
    let trimmed = s.strip_suffix('s')?;
    let seconds: f64 = trimmed.parse().ok()?;
    if !(0.0..=86_400.0).contains(&seconds) {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(30))
            .with_backoff_multiplier(1.5)
            .with_jitter_factor(0.2);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.jitter_factor, 0.2);
    }

    #[test]
    fn test_calculate_delay_grows_exponentially() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter_factor(0.0);

        let delay0 = config.calculate_delay(0);
        let delay1 = config.calculate_delay(1);
        let delay2 = config.calculate_delay(2);

        assert_eq!(delay0, Duration::from_secs(1));
        assert_eq!(delay1, Duration::from_secs(2));
        assert_eq!(delay2, Duration::from_secs(4));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter_factor(0.0);

        assert_eq!(config.calculate_delay(10), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_for_error_prefers_retry_info() {
        let config = RetryConfig::new().with_jitter_factor(0.0);
        let rate_limited = Error::rate_limited(Duration::from_secs(7));
        assert_eq!(
            config.delay_for_error(&rate_limited, 0),
            Duration::from_secs(7)
        );
        let other = Error::http(503, "");
        assert_eq!(config.delay_for_error(&other, 0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let config = RetryConfig::new().with_max_attempts(3);

        let call_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = call_count.clone();
        let result = retry_with_backoff(config, move || {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok::<i32, Error>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(10));

        let call_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = call_count.clone();
        let result = retry_with_backoff(config, move || {
            let count = count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            async move {
                if count < 3 {
                    Err(Error::timeout())
                } else {
                    Ok::<i32, Error>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conditional_retry_stops_on_permanent_error() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(10));

        let call_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = call_count.clone();
        let result: Result<i32> = retry_with_backoff_conditional(config, move || {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(Error::validation("bad request")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conditional_retry_exhausts_on_transient_error() {
        let config = RetryConfig::new()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(10));

        let call_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = call_count.clone();
        let result: Result<i32> = retry_with_backoff_conditional(config, move || {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(Error::timeout()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parse_retry_delay() {
        let body = r#"{
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                    "retryDelay": "2s"
                }]
            }
        }"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_parse_retry_delay_fractional() {
        let body = r#"{"error":{"details":[{"@type":".../RetryInfo","retryDelay":"1.5s"}]}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn test_parse_retry_delay_absent() {
        assert_eq!(parse_retry_delay(r#"{"error":{"message":"slow down"}}"#), None);
        assert_eq!(parse_retry_delay("not json"), None);
        // Unparseable delay string is treated as absent.
        let body = r#"{"error":{"details":[{"@type":".../RetryInfo","retryDelay":"soon"}]}}"#;
        assert_eq!(parse_retry_delay(body), None);
    }

    #[test]
    fn test_parse_quota_details() {
        let body = r#"{
            "error": {
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                    "violations": [{
                        "quotaMetric": "generativelanguage.googleapis.com/generate_requests",
                        "quotaId": "GenerateRequestsPerMinute"
                    }]
                }]
            }
        }"#;
        let (metric, id) = parse_quota_details(body);
        assert_eq!(
            metric.as_deref(),
            Some("generativelanguage.googleapis.com/generate_requests")
        );
        assert_eq!(id.as_deref(), Some("GenerateRequestsPerMinute"));
    }

    #[test]
    fn test_classify_http_error_429() {
        let body = r#"{"error":{"details":[{"@type":".../RetryInfo","retryDelay":"3s"}]}}"#;
        let classified = classify_http_error(Error::http(429, body));
        match classified {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_http_error_429_fallback() {
        let classified = classify_http_error(Error::http(429, "{}"));
        match classified {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, DEFAULT_RETRY_DELAY);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_http_error_passthrough() {
        let classified = classify_http_error(Error::http(500, "oops"));
        assert!(matches!(classified, Error::Http { status: 500, .. }));
    }
}
