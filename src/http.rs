//! Shared HTTP plumbing for the OpenAI-compatible clients.
//!
//! Both the embedding and the chat client go through [`send_with_retry`],
//! which retries rate-limited (429), server-error (5xx), and network
//! failures with exponential backoff, and turns everything else into a
//! typed [`CapabilityError`] immediately.

use std::time::Duration;

use docchat_core::CapabilityError;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

/// Upper bound on the backoff exponent: 1s, 2s, 4s, ... 32s.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Send the request built by `build`, retrying up to `max_retries` times.
///
/// `build` is called once per attempt since a `RequestBuilder` cannot be
/// reused after `send`.
pub async fn send_with_retry<F>(max_retries: u32, mut build: F) -> Result<Response, CapabilityError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(MAX_BACKOFF_SHIFT));
            debug!(attempt, delay_secs = delay.as_secs(), "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body = response.text().await.unwrap_or_default();
                let err = classify_status(status, &body);
                match err {
                    CapabilityError::RateLimit(_) | CapabilityError::Transient(_) => {
                        warn!(%status, attempt, "retryable API error");
                        last_err = Some(err);
                        continue;
                    }
                    _ => return Err(err),
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "request failed");
                last_err = Some(CapabilityError::Transient(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CapabilityError::Other("request failed after retries".into())))
}

/// Map a non-success status to a [`CapabilityError`] kind.
pub fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let message = format!("API error {}: {}", status, error_message(body));
    match status.as_u16() {
        401 | 403 => CapabilityError::Auth(message),
        429 => CapabilityError::RateLimit(message),
        s if (500..600).contains(&s) => CapabilityError::Transient(message),
        _ => CapabilityError::Other(message),
    }
}

/// Pull `error.message` out of an OpenAI error body, falling back to the
/// raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Build the shared client with a per-request timeout.
pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client, CapabilityError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| CapabilityError::Other(format!("failed to build HTTP client: {e}")))
}

/// Join a base URL such as `https://api.openai.com/v1` with an endpoint path.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
