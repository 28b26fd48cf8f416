pub mod playlist;
pub mod remux;
pub mod report;
pub mod segment;
pub mod state;
pub mod transfer;

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::{DownloadError, Result};
use crate::options::Options;

/// Statuses worth another attempt for idempotent requests.
const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct RetryPolicy {
    max_attempts: u32,
    backoff_factor: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). The first retry goes out immediately.
    fn delay(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.backoff_factor
            .checked_mul(multiplier)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Shared HTTP client. Cheap to clone, all clones use one connection pool.
#[derive(Debug, Clone)]
pub struct DownloadClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl DownloadClient {
    pub fn new(options: &Options) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .connect_timeout(options.request_timeout)
            .read_timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            client,
            policy: RetryPolicy {
                max_attempts: options.max_request_attempts.max(1),
                backoff_factor: options.backoff_factor,
            },
        })
    }

    /// GET with status retry. The body is not read, so the response can be streamed.
    /// A final non-2xx status is returned as is; use [`ensure_success`] to reject it.
    pub async fn fetch(&self, url: &Url, headers: &HeaderMap) -> Result<Response> {
        self.send(Method::GET, url, headers).await
    }

    pub async fn send(&self, method: Method, url: &Url, headers: &HeaderMap) -> Result<Response> {
        let attempts = if is_idempotent(&method) {
            self.policy.max_attempts
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            let response = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .send()
                .await?;

            let status = response.status();
            if attempt >= attempts || !RETRY_STATUSES.contains(&status) {
                debug!(%url, %status, attempt, "request finished");
                return Ok(response);
            }

            let delay = self.policy.delay(attempt);
            warn!(
                %url,
                %status,
                attempt,
                max = attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient server error"
            );
            drop(response);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Fetch a small text document such as a playlist.
    pub async fn get_text(&self, url: &Url, headers: &HeaderMap) -> Result<String> {
        let response = ensure_success(self.fetch(url, headers).await?)?;
        Ok(response.text().await?)
    }
}

pub fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DownloadError::HttpStatus {
            status,
            url: response.url().to_string(),
        })
    }
}
