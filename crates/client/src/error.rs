//! Error types for the swarmlm client

use thiserror::Error;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Session sizing arguments are inconsistent
    #[error("set either `max_length` or `max_new_tokens` (but not both) to reserve server-side attention caches")]
    SessionSizing,

    /// The generation collaborator failed
    #[error("Generation error: {0}")]
    Generation(String),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
