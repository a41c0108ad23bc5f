//! GAL error types
//!
//! Errors that reach the caller of a GAL operation. Throttling, missing
//! replicas, truncated results and stale history are not errors; they are
//! carried as response flags.

use thiserror::Error;

use galsync_directory::error::DirectoryError;

/// Errors surfaced by GAL search, autocomplete and sync.
#[derive(Debug, Error)]
pub enum GalError {
    /// The client sent a sync token that does not parse.
    #[error("Invalid sync token: {message}")]
    InvalidToken { message: String },

    #[error("Unknown domain: {domain}")]
    UnknownDomain { domain: String },

    /// Domain or source configuration cannot serve the request.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The replica mailbox failed while being read.
    #[error("Replica error: {message}")]
    Replica { message: String },

    /// A peer node could not be reached or answered with an error.
    #[error("Proxy error: {message}")]
    Proxy {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl GalError {
    pub fn invalid_token(message: impl Into<String>) -> Self {
        GalError::InvalidToken {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        GalError::Configuration {
            message: message.into(),
        }
    }

    pub fn replica(message: impl Into<String>) -> Self {
        GalError::Replica {
            message: message.into(),
        }
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        GalError::Proxy {
            message: message.into(),
            source: None,
        }
    }

    pub fn proxy_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        GalError::Proxy {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if the caller may retry with the same token.
    pub fn is_retryable(&self) -> bool {
        match self {
            GalError::Directory(e) => e.is_transient(),
            GalError::Replica { .. } | GalError::Proxy { .. } => true,
            _ => false,
        }
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            GalError::InvalidToken { .. } => "INVALID_TOKEN",
            GalError::UnknownDomain { .. } => "UNKNOWN_DOMAIN",
            GalError::Configuration { .. } => "CONFIGURATION_ERROR",
            GalError::Directory(e) if e.is_transient() => "DIRECTORY_UNAVAILABLE",
            GalError::Directory(e) => e.error_code(),
            GalError::Replica { .. } => "REPLICA_ERROR",
            GalError::Proxy { .. } => "PROXY_ERROR",
        }
    }
}

/// Result type for GAL operations.
pub type GalResult<T> = Result<T, GalError>;
