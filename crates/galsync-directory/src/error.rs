//! Directory error types
//!
//! Error definitions with server-down/transient classification for the
//! single pool-level retry and for response mapping.

use thiserror::Error;

/// Error that can occur during directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Connection errors
    /// Failed to establish a connection to any configured endpoint.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An established connection reported that the server went away.
    #[error("server down: {message}")]
    ServerDown {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timed out waiting for a pooled connection.
    #[error("connection checkout timed out after {timeout_ms}ms")]
    CheckoutTimeout { timeout_ms: u64 },

    /// Bind rejected the configured credentials.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    // Configuration errors (fatal at setup)
    /// Endpoint, pool or capacity configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// A filter could not be constructed from the query.
    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },

    // Operation errors
    /// Entry does not exist.
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// Entry already exists.
    #[error("object already exists: {identifier}")]
    ObjectAlreadyExists { identifier: String },

    /// Server truncated a non-paged result set.
    #[error("size limit exceeded after {returned} entries")]
    SizeLimitExceeded { returned: usize },

    /// An attribute callback refused a proposed change.
    #[error("attribute '{attribute}' rejected: {message}")]
    AttributeRejected { attribute: String, message: String },

    /// Any other failed directory operation.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        // Raw LDAP result code when the server supplied one.
        result_code: Option<u32>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl DirectoryError {
    /// Check if the error means the connection or server is gone and the
    /// operation may succeed on a fresh connection.
    pub fn is_server_down(&self) -> bool {
        matches!(self, DirectoryError::ServerDown { .. })
    }

    /// Check if this error is transient and the caller may retry later
    /// from the same token.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. }
                | DirectoryError::ServerDown { .. }
                | DirectoryError::CheckoutTimeout { .. }
        )
    }

    /// Check if the error is a setup-time configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DirectoryError::InvalidConfiguration { .. } | DirectoryError::InvalidFilter { .. }
        )
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::ServerDown { .. } => "SERVER_DOWN",
            DirectoryError::CheckoutTimeout { .. } => "CHECKOUT_TIMEOUT",
            DirectoryError::AuthenticationFailed => "AUTH_FAILED",
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            DirectoryError::InvalidFilter { .. } => "INVALID_FILTER",
            DirectoryError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            DirectoryError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            DirectoryError::SizeLimitExceeded { .. } => "SIZE_LIMIT_EXCEEDED",
            DirectoryError::AttributeRejected { .. } => "ATTRIBUTE_REJECTED",
            DirectoryError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a server down error.
    pub fn server_down(message: impl Into<String>) -> Self {
        DirectoryError::ServerDown {
            message: message.into(),
            source: None,
        }
    }

    /// Create a server down error with source.
    pub fn server_down_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ServerDown {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        DirectoryError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an invalid filter error.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        DirectoryError::InvalidFilter {
            message: message.into(),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            result_code: None,
            source: None,
        }
    }

    /// Create an operation failed error carrying the LDAP result code.
    pub fn operation_failed_with_code(message: impl Into<String>, result_code: u32) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            result_code: Some(result_code),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            result_code: None,
            source: Some(Box::new(source)),
        }
    }

    /// LDAP result code attached to the error, if any.
    pub fn result_code(&self) -> Option<u32> {
        match self {
            DirectoryError::OperationFailed { result_code, .. } => *result_code,
            DirectoryError::ObjectNotFound { .. } => Some(32),
            DirectoryError::ObjectAlreadyExists { .. } => Some(68),
            DirectoryError::AuthenticationFailed => Some(49),
            DirectoryError::SizeLimitExceeded { .. } => Some(4),
            _ => None,
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
