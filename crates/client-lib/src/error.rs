//! Client error type.
use thiserror::Error;

/// Errors surfaced to callers of the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid URL: {0}")]
    Url(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed")]
    StreamClosed,

    #[error("stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("client is shut down")]
    NotRunning,
}

impl ClientError {
    /// Whether the server refused the request itself (4xx)
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if (400..500).contains(status))
    }
}
