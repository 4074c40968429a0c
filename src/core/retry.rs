//! Transport retry helpers.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

/// Statuses worth a transport-level retry. Client errors are not
/// retried; neither are parse failures.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Backoff for the given 0-based attempt: exponential on a base delay
/// with up to 10% jitter to spread simultaneous retries.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_scale: f64 = rand::rng().random_range(-0.1..=0.1);
    let jitter_ms = (exp.as_millis() as f64 * jitter_scale) as i64;
    let adjusted = (exp.as_millis() as i64 + jitter_ms).max(0) as u64;
    Duration::from_millis(adjusted)
}
