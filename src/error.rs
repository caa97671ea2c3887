//! Error types for image generation.

use std::time::Duration;

/// Maximum length of an upstream error body carried in an error message.
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Errors that can occur while talking to the upstream inference endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DreamPixelError {
    /// API token missing or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Upstream returned a non-success status we have no special handling for.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Upstream answered 429.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Upstream answered 503 while the model is loading.
    #[error("model is loading, estimated time {estimated_time:?}")]
    ModelLoading { estimated_time: Option<Duration> },

    /// A single upstream call exceeded its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Network or HTTP error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response body could not be interpreted.
    #[error("failed to decode: {0}")]
    Decode(String),

    /// I/O error (e.g., saving file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl DreamPixelError {
    /// Returns true if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ModelLoading { .. }
                | Self::Timeout(_)
                | Self::Network(_)
                | Self::Api { .. }
        )
    }

    /// Returns the wait hint supplied by the server, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::ModelLoading { estimated_time } => *estimated_time,
            _ => None,
        }
    }
}

/// Parses a `Retry-After` header expressed in whole seconds.
///
/// HTTP-date values are ignored.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Trims an upstream error body down to something fit for a log line.
pub fn sanitize_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".into();
    }
    if trimmed.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
    truncated.push('…');
    truncated
}

/// Result type alias for image generation operations.
pub type Result<T> = std::result::Result<T, DreamPixelError>;
