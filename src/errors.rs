//! Typed error hierarchy for the runclaim worker.
//!
//! Two top-level enums cover the two boundaries where callers need to match:
//! - `ConfigError`: startup configuration failures (the only fatal class)
//! - `StoreError`: remote run store failures, kept distinct from CAS misses

use thiserror::Error;

/// Errors raised while assembling the worker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required environment variable {name} is not set")]
    MissingEnv { name: &'static str },

    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    FileParse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Errors from the remote run store.
///
/// A conditional patch that matches zero rows is *not* an error; it comes back
/// as an empty row set. Everything here means the store could not answer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run store request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Run store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode run store response: {0}")]
    Decode(String),

    #[error("Run store unavailable")]
    Unavailable,
}

impl StoreError {
    /// Whether retrying the same request later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) | StoreError::Unavailable => true,
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::Decode(_) => false,
        }
    }
}
