//! Thin HTTP client wrapper used by [`crate::worker`] to open attempt streams.

use std::time::Duration;

use reqwest::{Client, Response};
use tracing::instrument;
use url::Url;

use super::error::DownloadError;

/// Browser User-Agent the worker retries with once a fresh request gets a
/// 403, before classifying it as a failure (§4.6 EXPANSION).
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// URL patterns indicating a login/SSO redirect, used to tell a genuine
/// login page apart from an HTML error page served at the same status.
const LOGIN_PATTERNS: &[&str] = &[
    "/login", "/signin", "/sign-in", "/auth/", "/sso", "/cas/login", "/saml", "/oauth", "/openid", "/idp/",
];

/// Reusable HTTP client with connection pooling (§4.6 step 4).
///
/// One instance is shared across all workers; `reqwest::Client` is cheap
/// to clone and pools connections internally.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client with the given per-attempt connect timeout.
    ///
    /// # Panics
    ///
    /// Panics if the underlying TLS/connector configuration cannot be
    /// built, which only happens if the platform lacks a usable root
    /// certificate store.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Opens a GET request against `url`, optionally resuming from
    /// `resume_offset` via a `Range: bytes=N-` header, bounded by
    /// `total_timeout` for the whole response, and optionally overriding
    /// the User-Agent (used for the browser-UA retry on a fresh 403).
    ///
    /// Returns the raw [`Response`] so the caller can branch on status
    /// (200 full vs. 206 partial vs. anything else, a transient failure
    /// per §4.6 step 4) before streaming the body.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] on connection failure,
    /// [`DownloadError::Timeout`] if `total_timeout` elapses before headers
    /// arrive.
    #[instrument(skip(self), fields(url = %url, resume_offset))]
    pub async fn open_stream(
        &self,
        url: &Url,
        resume_offset: Option<u64>,
        total_timeout: Duration,
        user_agent: Option<&str>,
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.get(url.clone()).timeout(total_timeout);
        if let Some(offset) = resume_offset {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        if let Some(ua) = user_agent {
            request = request.header(reqwest::header::USER_AGENT, ua);
        }

        request.send().await.map_err(|source| {
            if source.is_timeout() {
                DownloadError::Timeout { url: url.to_string() }
            } else {
                DownloadError::Network {
                    url: url.to_string(),
                    source,
                }
            }
        })
    }
}

/// Detects a login/SSO redirect: an HTML body returned where one of this
/// system's binary ebook formats was requested (§4.6 EXPANSION). Only
/// flags responses whose final URL carries a recognizable login pattern,
/// so an HTML error page at the same status isn't misclassified.
#[must_use]
pub fn detect_login_redirect(response: &Response) -> bool {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.to_ascii_lowercase().contains("text/html") {
        return false;
    }

    let response_url = response.url().as_str().to_ascii_lowercase();
    LOGIN_PATTERNS.iter().any(|pattern| response_url.contains(pattern))
}
