//! HTTP retry policy with exponential backoff.
//!
//! # Retry Policy
//!
//! - Max retries: 2 (3 total attempts)
//! - Initial delay: 500ms
//! - Max delay: 8 seconds
//! - Jitter: down-jitter up to 25% (multiplier in [0.75, 1.0])
//!
//! # Retryable Conditions
//!
//! - HTTP 408, 409, 429, 5xx
//! - Connection errors
//! - `x-should-retry: true` forces retry
//! - `x-should-retry: false` forbids retry
//!
//! Every attempt of one logical request carries the same `Idempotency-Key`
//! so the API can deduplicate, plus an `X-Retry-Count` for diagnostics.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use uuid::Uuid;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting initial request).
    pub max_retries: u32,
    /// Initial backoff delay before first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

/// Parse `Retry-After` or `Retry-After-Ms` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
/// Returns `None` if headers are missing, invalid, or out of range.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    // Retry-After-Ms first (milliseconds, float)
    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.parse::<f64>()
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    // Retry-After (seconds, integer)
    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    None
}

/// Determine if a response status is retryable.
///
/// Respects `x-should-retry` header override if present.
#[must_use]
pub fn should_retry(status: StatusCode, headers: &HeaderMap) -> bool {
    if let Some(val) = headers.get("x-should-retry")
        && let Ok(s) = val.to_str()
    {
        if s.eq_ignore_ascii_case("true") {
            return true;
        }
        if s.eq_ignore_ascii_case("false") {
            return false;
        }
    }

    matches!(
        status.as_u16(),
        408 | 409 | 429 | 500 | 502 | 503 | 504 | 520..=599
    )
}

/// Calculate retry delay with exponential backoff and jitter.
///
/// - `backoff_step`: 0 before first retry, 1 before second, etc.
/// - Respects `Retry-After` headers if present and valid.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    headers: Option<&HeaderMap>,
) -> Duration {
    if let Some(headers) = headers
        && let Some(delay) = parse_retry_after(headers)
    {
        return delay;
    }

    // Exponential backoff: initial_delay * 2^backoff_step
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Down-jitter: multiply by random factor in [1 - jitter_factor, 1.0]
    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

fn add_retry_headers(
    builder: RequestBuilder,
    retry_count: u32,
    idempotency_key: &str,
) -> RequestBuilder {
    builder
        .header("X-Retry-Count", retry_count.to_string())
        .header("Idempotency-Key", idempotency_key)
}

#[must_use]
pub fn generate_idempotency_key() -> String {
    format!("muse-retry-{}", Uuid::new_v4())
}

/// Outcome of a retry operation.
///
/// This is a sum type that structurally distinguishes success from failure,
/// ensuring callers cannot accidentally treat an error response as success.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Request succeeded (2xx status).
    Success(Response),
    /// Request failed with an HTTP error after exhausting retries.
    /// The response is provided for error body inspection.
    HttpError(Response),
    /// Request failed with a connection/transport error after exhausting retries.
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
    /// Request failed with a non-retryable connection error on first attempt.
    NonRetryable(reqwest::Error),
}

impl RetryOutcome {
    /// Returns true if this is a successful response.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Send a request with automatic retries.
///
/// `build_request` is called once per attempt; all attempts share one
/// `Idempotency-Key`. Retries on connection errors and retryable HTTP
/// statuses, honoring `Retry-After` and the `x-should-retry` override.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let idempotency_key = generate_idempotency_key();

    if config.max_retries == 0 {
        return execute_single_attempt(&build_request, &idempotency_key, 0).await;
    }

    // Attempts 0 through max_retries-1: can retry on failure
    for retry_count in 0..config.max_retries {
        let request = add_retry_headers(build_request(), retry_count, &idempotency_key);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();

                if status.is_success() {
                    return RetryOutcome::Success(response);
                }

                if should_retry(status, &headers) {
                    let delay = calculate_retry_delay(retry_count, config, Some(&headers));
                    tracing::debug!(
                        status = %status,
                        retry_count = retry_count + 1,
                        delay_ms = delay.as_millis(),
                        "Retrying request after error status"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                // Non-retryable HTTP status
                return RetryOutcome::HttpError(response);
            }
            Err(e) => {
                if is_retryable_error(&e) {
                    let delay = calculate_retry_delay(retry_count, config, None);
                    tracing::debug!(
                        error = %e,
                        retry_count = retry_count + 1,
                        delay_ms = delay.as_millis(),
                        "Retrying request after connection error"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if retry_count == 0 {
                    return RetryOutcome::NonRetryable(e);
                }
                return RetryOutcome::ConnectionError {
                    attempts: retry_count + 1,
                    source: e,
                };
            }
        }
    }

    // Final attempt (retry_count == max_retries): no more retries possible
    let request = add_retry_headers(build_request(), config.max_retries, &idempotency_key);

    match request.send().await {
        Ok(response) => {
            if response.status().is_success() {
                RetryOutcome::Success(response)
            } else {
                RetryOutcome::HttpError(response)
            }
        }
        Err(e) => RetryOutcome::ConnectionError {
            attempts: config.max_retries + 1,
            source: e,
        },
    }
}

async fn execute_single_attempt<F>(
    build_request: &F,
    idempotency_key: &str,
    retry_count: u32,
) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let request = add_retry_headers(build_request(), retry_count, idempotency_key);

    match request.send().await {
        Ok(response) => {
            if response.status().is_success() {
                RetryOutcome::Success(response)
            } else {
                RetryOutcome::HttpError(response)
            }
        }
        Err(e) => RetryOutcome::NonRetryable(e),
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}
