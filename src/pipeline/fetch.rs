//! Image fetching: HTTP GET with retry and backoff.
//!
//! IIIF image servers in front of digital repositories throttle and hiccup
//! under batch load. Timeouts, connection resets, and 5xx/429 responses are
//! retried on the shared [`RetryPolicy`]; any other 4xx means the image
//! does not exist or is forbidden, and retrying would only hammer the host,
//! so it fails permanently on the first response.
//!
//! No caching. The bytes live exactly as long as the per-item pipeline.

use crate::error::ItemError;
use crate::retry::{retryable_status, RetryPolicy};
use crate::TranscribeConfig;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Raw image bytes plus the server-reported content type.
///
/// Owned transiently: produced by the fetcher, consumed by the encoder.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Build the shared HTTP client used for image and manifest requests.
///
/// One pooled client per run; per-request timeouts come from the config so
/// no call can wait indefinitely.
pub fn build_client(config: &TranscribeConfig) -> Result<reqwest::Client, crate::TranscribeError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .build()
        .map_err(|e| crate::TranscribeError::Internal(format!("HTTP client: {e}")))
}

/// Fetch an image, retrying transient failures.
///
/// Returns the image plus the number of retries consumed. Failures carry
/// the offending URL and the attempt count.
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    policy: &RetryPolicy,
) -> Result<(RawImage, u32), ItemError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let transient_detail = match client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let content_type = resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
                        .unwrap_or_else(|| "application/octet-stream".to_string());

                    match resp.bytes().await {
                        Ok(bytes) => {
                            debug!(url, size = bytes.len(), "fetched image");
                            return Ok((
                                RawImage {
                                    bytes: bytes.to_vec(),
                                    content_type,
                                },
                                attempt - 1,
                            ));
                        }
                        // The connection dropped mid-body; same class as a reset.
                        Err(e) => format!("body read failed: {e}"),
                    }
                } else if retryable_status(status.as_u16()) {
                    format!("HTTP {}", status.as_u16())
                } else if status.is_client_error() {
                    return Err(ItemError::Fetch {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                } else {
                    format!("unexpected HTTP {}", status.as_u16())
                }
            }
            Err(e) => format!("{e}"),
        };

        if !policy.should_retry(attempt) {
            return Err(ItemError::Network {
                url: url.to_string(),
                attempts: attempt,
                detail: transient_detail,
            });
        }

        let backoff = policy.delay(attempt);
        warn!(
            url,
            attempt,
            max = policy.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            detail = %transient_detail,
            "transient fetch failure, retrying"
        );
        sleep(backoff).await;
    }
}
