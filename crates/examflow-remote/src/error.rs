//! Remote error types.

use thiserror::Error;

use examflow_core::SubmissionError;

/// Errors from the content API.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// Authentication failed (missing or invalid token).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<RemoteError> for SubmissionError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::ApiError { status, message } => {
                SubmissionError::Rejected { status, message }
            }
            RemoteError::AuthenticationFailed(message) => SubmissionError::Rejected {
                status: 401,
                message,
            },
            RemoteError::Decode(message) => SubmissionError::Invalid(message),
            other => SubmissionError::Transport(other.to_string()),
        }
    }
}
