use thiserror::Error;

/// Errors from the backend API.
///
/// The split that matters to the rest of the engine is
/// [`ApiError::is_transient`]: transient failures are retried or queued,
/// everything else is a definitive answer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded its timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {status}")]
    HttpStatus { status: u16, message: Option<String> },
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response body did not match the expected shape
    #[error("Malformed response: {0}")]
    Decode(String),
    /// URL failed validation before any request was made
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// True for failures worth retrying later: timeouts, connection errors,
    /// 5xx and rate limiting.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout | ApiError::RateLimited(_) => true,
            ApiError::HttpStatus { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ApiError::ResponseTooLarge | ApiError::Decode(_) | ApiError::InvalidUrl(_) => false,
        }
    }

    /// A definitive 4xx answer from the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ApiError::HttpStatus { status, .. } if (400..500).contains(status) && *status != 408 && *status != 429)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
