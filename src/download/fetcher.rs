//! 单次网络请求，带重试与指数退避。
//!
//! `PageFetcher` 是唯一访问网络的组件；章节之间、图片之间的节奏由调用方控制。

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::base_system::context::Config;
use crate::base_system::retry::{RetryPolicy, sleep_cancellable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind<'a> {
    /// HTML page (series page, chapter list, image list).
    Page,
    /// Image binary; the referer is the chapter page it appears on.
    Image { referer: Option<&'a str> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("fetching {url} failed after {attempts} attempt(s): {last_error}")]
    Failed {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("fetching {url} was cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str, kind: FetchKind<'_>) -> Result<Vec<u8>, FetchError> {
        self.fetch_observed(url, kind, &|_: u32, _: &FetchError| {})
    }

    /// Like `fetch`, calling `on_retry(next_attempt, error)` before every
    /// backoff sleep.
    fn fetch_observed(
        &self,
        url: &str,
        kind: FetchKind<'_>,
        on_retry: &dyn Fn(u32, &FetchError),
    ) -> Result<Vec<u8>, FetchError>;
}

/// Result of one attempt.
enum Attempt {
    Body(Vec<u8>),
    Retry(String),
    Fatal(String),
}

pub struct PageFetcher {
    client: Client,
    policy: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
}

impl PageFetcher {
    pub fn new(config: &Config, cancel: Option<Arc<AtomicBool>>) -> anyhow::Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        default_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let client = Client::builder()
            .default_headers(default_headers)
            .user_agent(config.user_agent.clone())
            .timeout(std::time::Duration::from_secs(config.request_timeout.max(1)))
            .build()?;

        Ok(Self {
            client,
            policy: config.retry_policy(),
            cancel,
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn headers_for(kind: FetchKind<'_>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match kind {
            FetchKind::Page => {
                headers.insert(
                    ACCEPT,
                    HeaderValue::from_static(
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    ),
                );
            }
            FetchKind::Image { referer } => {
                headers.insert(
                    ACCEPT,
                    HeaderValue::from_static("image/avif,image/webp,image/*,*/*;q=0.8"),
                );
                if let Some(v) = referer.and_then(|r| HeaderValue::from_str(r).ok()) {
                    headers.insert(REFERER, v);
                }
            }
        }
        headers
    }

    fn attempt(&self, url: &str, kind: FetchKind<'_>) -> Attempt {
        let resp = match self.client.get(url).headers(Self::headers_for(kind)).send() {
            Ok(r) => r,
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let status = resp.status();
        if !status.is_success() {
            let msg = format!("HTTP {status}");
            return if is_retryable_status(status) {
                Attempt::Retry(msg)
            } else {
                Attempt::Fatal(msg)
            };
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let body = match resp.bytes() {
            Ok(b) => b.to_vec(),
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        if matches!(kind, FetchKind::Image { .. }) {
            if let Err(reason) = check_image(content_type.as_deref(), &body) {
                return Attempt::Fatal(reason);
            }
        }

        Attempt::Body(body)
    }
}

impl Fetch for PageFetcher {
    fn fetch_observed(
        &self,
        url: &str,
        kind: FetchKind<'_>,
        on_retry: &dyn Fn(u32, &FetchError),
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 1u32;
        loop {
            if self.is_cancelled() {
                return Err(FetchError::Cancelled {
                    url: url.to_string(),
                });
            }

            let last_error = match self.attempt(url, kind) {
                Attempt::Body(body) => {
                    debug!(target: "fetch", url, attempt, bytes = body.len(), "fetched");
                    return Ok(body);
                }
                Attempt::Fatal(reason) => {
                    warn!(target: "fetch", url, attempt, %reason, "non-retryable failure");
                    return Err(FetchError::Failed {
                        url: url.to_string(),
                        attempts: attempt,
                        last_error: reason,
                    });
                }
                Attempt::Retry(reason) => reason,
            };

            let err = FetchError::Failed {
                url: url.to_string(),
                attempts: attempt,
                last_error,
            };
            if !self.policy.should_retry(attempt) {
                warn!(target: "fetch", url, attempts = attempt, "retries exhausted");
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt);
            debug!(target: "fetch", url, attempt, ?delay, error = %err, "retrying");
            on_retry(attempt + 1, &err);
            if let Some(cancel) = &self.cancel {
                if !sleep_cancellable(delay, cancel) {
                    return Err(FetchError::Cancelled {
                        url: url.to_string(),
                    });
                }
            } else {
                std::thread::sleep(delay);
            }
            attempt += 1;
        }
    }
}

impl PageFetcher {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(crate::base_system::retry::is_cancelled)
    }
}

/// 5xx, 408 and 429 are worth another try; every other client error is final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Accepts any body whose bytes are a known image format, whatever the
/// server labelled it. Unrecognised bytes are rejected, with the declared
/// type in the message when the server clearly sent something else.
pub fn check_image(content_type: Option<&str>, body: &[u8]) -> Result<(), String> {
    if image::guess_format(body).is_ok() {
        return Ok(());
    }
    match content_type {
        Some(ct) if is_non_image_type(ct) => Err(format!("unexpected content type {ct}")),
        _ => Err("body is not a recognizable image".to_string()),
    }
}

fn is_non_image_type(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/xhtml")
}
