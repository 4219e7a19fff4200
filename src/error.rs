//! Skuld error types

use std::time::Duration;

/// Skuld error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum SkuldError {
    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    // Data errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Client-side form rule failed; never sent to the backend.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fetcher-reported failure that does not fit the transport variants.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Cache entry holds a value of a different type than requested.
    #[error("cached value for {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// Request was cancelled cooperatively. Not treated as a failure by the
    /// query layer: cancelled fetches leave the cache untouched.
    #[error("request cancelled")]
    Cancelled,

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SkuldError {
    /// Whether a read query may retry after this error.
    ///
    /// Transport and server errors are retryable; cancellation, client-side
    /// validation and programming errors are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SkuldError::Cancelled
                | SkuldError::Validation(_)
                | SkuldError::TypeMismatch { .. }
                | SkuldError::Configuration(_)
        )
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SkuldError::Cancelled)
    }

    /// HTTP status code, when the backend answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            SkuldError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SkuldError {
    fn from(err: serde_json::Error) -> Self {
        SkuldError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for SkuldError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            SkuldError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SkuldError::Json(err.to_string())
        } else {
            SkuldError::Http(err.to_string())
        }
    }
}

/// Result type alias for Skuld operations
pub type Result<T> = std::result::Result<T, SkuldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!SkuldError::Cancelled.is_retryable());
        assert!(SkuldError::Cancelled.is_cancelled());
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(SkuldError::Http("connection reset".into()).is_retryable());
        assert!(
            SkuldError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(SkuldError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn validation_is_permanent() {
        assert!(!SkuldError::Validation("name is required".into()).is_retryable());
    }

    #[test]
    fn status_only_for_api_errors() {
        let err = SkuldError::Api {
            status: 404,
            message: "not found".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(SkuldError::Http("x".into()).status(), None);
    }

    #[test]
    fn display_messages() {
        let err = SkuldError::Api {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "API error (500): boom");
        assert_eq!(SkuldError::Cancelled.to_string(), "request cancelled");
    }
}
