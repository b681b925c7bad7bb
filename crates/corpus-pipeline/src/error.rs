//! Error types for the corpus pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed document key (traversal, empty segment, ...)
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Object store could not be reached
    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    /// Object missing from the store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Content type could not be recognized or has no handler
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Every extraction strategy failed for a document
    #[error("Extraction failed for '{identifier}': {message}")]
    ExtractionFailed { identifier: String, message: String },

    /// Raw content above the configured ceiling
    #[error("Content size {size} exceeds limit of {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },

    /// A tokenizer rejected its input
    #[error("Tokenizer '{tokenizer}' failed: {message}")]
    TokenizeFailed { tokenizer: String, message: String },

    /// Operation exceeded its deadline
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// Stages can only advance one step at a time
    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification carried in per-document outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidKey,
    StoreUnavailable,
    NotFound,
    UnsupportedFormat,
    ExtractionFailed,
    SizeExceeded,
    TokenizeFailed,
    Timeout,
    InvalidTransition,
    Config,
    Encoding,
    Io,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::SizeExceeded => "size_exceeded",
            ErrorKind::TokenizeFailed => "tokenize_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Config => "config",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an extraction failure
    pub fn extraction_failed(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    /// Create a tokenizer failure
    pub fn tokenize_failed(tokenizer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TokenizeFailed {
            tokenizer: tokenizer.into(),
            message: message.into(),
        }
    }

    /// Create a store connectivity error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classification used when the error crosses a job boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidKey { .. } => ErrorKind::InvalidKey,
            Error::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::ExtractionFailed { .. } => ErrorKind::ExtractionFailed,
            Error::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            Error::TokenizeFailed { .. } => ErrorKind::TokenizeFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::Config(_) => ErrorKind::Config,
            Error::Encoding(_) | Error::Json(_) => ErrorKind::Encoding,
            Error::Io(_) => ErrorKind::Io,
            Error::Http(_) => ErrorKind::ExtractionFailed,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Encoding(format!("zip archive: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Task join error: {}", e))
    }
}
