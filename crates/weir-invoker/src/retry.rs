use std::time::Duration;

use reqwest::StatusCode;

use weir_core::config::RetryConfig;
use weir_core::error::WeirError;

pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Map a non-success HTTP status to a failure class. Rate limits and
/// server-side errors are worth retrying; other client errors are not.
pub fn classify_status(status: StatusCode, detail: &str) -> WeirError {
    let msg = format!("HTTP {}: {}", status.as_u16(), detail);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        WeirError::Transient(msg)
    } else {
        WeirError::Permanent(msg)
    }
}

pub fn classify_request_error(e: reqwest::Error, timeout_secs: u64) -> WeirError {
    if e.is_timeout() {
        WeirError::Timeout { timeout_secs }
    } else {
        WeirError::Transient(format!("request failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 3000,
        };
        // Jitter keeps each delay within 0.8x..1.2x of the nominal value
        let first = calculate_backoff(0, &config).as_millis() as u64;
        assert!((800..=1200).contains(&first), "got {}", first);
        let second = calculate_backoff(1, &config).as_millis() as u64;
        assert!((1600..=2400).contains(&second), "got {}", second);
        let capped = calculate_backoff(4, &config).as_millis() as u64;
        assert!(capped <= 3600, "got {}", capped);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "down").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "late").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "schema").is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND, "gone").is_retryable());
    }
}
