//! Shared plumbing for the small JSON services the gateway consults: the
//! permission service, the configuration centre and the grade-label service.

use std::time::Duration;

#[derive(Debug)]
pub enum UpstreamError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "upstream request timed out"),
            UpstreamError::Http(err) => write!(f, "upstream HTTP error: {}", err),
            UpstreamError::BadStatus(status) => write!(f, "upstream returned status {}", status),
            UpstreamError::InvalidResponse => write!(f, "upstream returned invalid JSON response"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Http(value)
        }
    }
}

impl UpstreamError {
    pub fn outcome(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Http(_) => "error",
            UpstreamError::BadStatus(_) => "bad_status",
            UpstreamError::InvalidResponse => "invalid_response",
        }
    }
}

/// Builds a pooled client. `timeout` is the default deadline; callers with
/// per-service deadlines override it per request.
pub fn http_client(timeout: Duration, tls_verify: bool) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!tls_verify)
        .build()
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
