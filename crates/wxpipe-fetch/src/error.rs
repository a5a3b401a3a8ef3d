use thiserror::Error;
use wxpipe_core::CityTarget;

/// Why a single attempt against the weather API failed.
#[derive(Debug, Error)]
pub enum FetchFailure {
    /// Network or TLS failure from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP 429.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// HTTP 5xx.
    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Any other non-2xx status, e.g. 401 invalid key or 404 city not found.
    #[error("rejected by API: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The body is not JSON or lacks a required field.
    #[error("unexpected response shape: {0}")]
    Schema(String),

    /// The run deadline passed before an attempt could start or its reading
    /// arrived.
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

impl FetchFailure {
    /// Returns `true` for failures worth another attempt after a back-off delay.
    ///
    /// **Retryable:** timeouts, connection failures, HTTP 429 and 5xx.
    ///
    /// **Terminal:** every other 4xx, malformed responses, request-building
    /// errors and an exceeded deadline.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchFailure::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            FetchFailure::RateLimited { .. } | FetchFailure::ServerError { .. } => true,
            FetchFailure::Rejected { .. }
            | FetchFailure::Schema(_)
            | FetchFailure::DeadlineExceeded => false,
        }
    }
}

/// Final error for one city once the retry budget is spent or a terminal
/// failure was hit.
#[derive(Debug, Error)]
#[error("fetch failed for {target} after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub target: CityTarget,
    pub retryable: bool,
    pub attempts: u32,
    #[source]
    pub cause: FetchFailure,
}

impl FetchError {
    #[must_use]
    pub fn new(target: CityTarget, cause: FetchFailure, attempts: u32) -> Self {
        Self {
            target,
            retryable: cause.is_retryable(),
            attempts,
            cause,
        }
    }
}

/// Errors building a [`crate::WeatherClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}
