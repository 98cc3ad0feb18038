//! Error types for crawlbatch.
//!
//! Library crates use [`CrawlBatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all crawlbatch operations.
#[derive(Debug, thiserror::Error)]
pub enum CrawlBatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Remote executor failure (transport, timeout, or non-success status).
    #[error("remote error: {0}")]
    Remote(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Structurally invalid job state (bad checkpoint, inconsistent units).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Unreadable input table.
    #[error("input error: {message}")]
    Input { message: String },

    /// JSON encoding or decoding of persisted payloads.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CrawlBatchError>;

impl CrawlBatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an input error from any displayable message.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CrawlBatchError::config("missing base url");
        assert_eq!(err.to_string(), "config error: missing base url");

        let err = CrawlBatchError::validation("checkpoint 7 exceeds 3 units");
        assert!(err.to_string().contains("checkpoint 7"));

        let err = CrawlBatchError::Remote("kw1: HTTP 502 Bad Gateway".into());
        assert_eq!(err.to_string(), "remote error: kw1: HTTP 502 Bad Gateway");
    }

    #[test]
    fn serde_errors_convert() {
        let parse: std::result::Result<Vec<u32>, _> = serde_json::from_str("not json");
        let err: CrawlBatchError = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("serialization error"));
    }
}
