//! Error types for the regional query engine
//!
//! Every failure that crosses the engine boundary is a [`QueryError`]. Raw
//! backend errors ([`crate::storage::BackendError`]) are converted at the
//! resilience boundary and never reach callers. Callers can reason about the
//! normalized [`ErrorKind`] instead of matching individual variants.

use crate::storage::{BackendCode, BackendError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// Errors surfaced by the query engine
#[derive(Error, Debug)]
pub enum QueryError {
    /// Transient backend failure (unavailable, aborted, overloaded, ...)
    #[error("Transient backend failure ({code}): {message}")]
    Transient { code: BackendCode, message: String },

    /// An attempt exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The endpoint's circuit breaker is open
    #[error("Circuit open for endpoint '{endpoint}', retry in {retry_after:?}")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    /// A composite index required by the query is still building
    #[error("Index not ready: {0}")]
    IndexNotReady(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Permission denied errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed request or invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Document or collection missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend refused the request for a non-transient reason
    #[error("Request rejected by backend: {0}")]
    Rejected(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Normalized error taxonomy observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried automatically; surfaced only after retries are exhausted
    Transient,
    /// Failing fast; back off longer than the normal retry delay
    CircuitOpen,
    /// User-actionable; retrying immediately will not help
    IndexNotReady,
    /// Never retried
    Fatal,
}

/// Structured error code for machine-readable error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Backend availability (1000-1099)
    BackendUnavailable,
    BackendTimeout,
    CircuitOpen,

    // Access (1100-1199)
    InvalidCredentials,
    PermissionDenied,

    // Configuration (1200-1299)
    ConfigurationInvalid,

    // Data (1400-1499)
    ParsingFailed,
    InvalidInput,
    DocumentNotFound,

    // Backend state (1600-1699)
    IndexNotReady,
    RequestRejected,

    // Internal (1900-1999)
    InternalError,
    Cancelled,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> u32 {
        match self {
            ErrorCode::BackendUnavailable => 1001,
            ErrorCode::BackendTimeout => 1002,
            ErrorCode::CircuitOpen => 1003,

            ErrorCode::InvalidCredentials => 1101,
            ErrorCode::PermissionDenied => 1102,

            ErrorCode::ConfigurationInvalid => 1201,

            ErrorCode::ParsingFailed => 1401,
            ErrorCode::InvalidInput => 1402,
            ErrorCode::DocumentNotFound => 1403,

            ErrorCode::IndexNotReady => 1601,
            ErrorCode::RequestRejected => 1602,

            ErrorCode::InternalError => 1901,
            ErrorCode::Cancelled => 1902,
        }
    }

    /// Get error category
    pub fn category(&self) -> &'static str {
        match self.as_number() {
            1000..=1099 => "availability",
            1100..=1199 => "access",
            1200..=1299 => "configuration",
            1400..=1499 => "data",
            1600..=1699 => "backend",
            1900..=1999 => "internal",
            _ => "unknown",
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Enhanced error representation for logging and API responses
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub code_number: u32,
    pub category: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub is_retryable: bool,
    pub component: String,
    pub operation: String,
    pub recovery_hint: &'static str,
    pub severity: ErrorSeverity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub correlation_id: Option<String>,
}

/// Serializable failure reason attached to empty pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReason {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
    pub hint: String,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl QueryError {
    /// Create a transient error with an explicit backend code
    pub fn transient<S: Into<String>>(code: BackendCode, msg: S) -> Self {
        Self::Transient {
            code,
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a circuit-open error
    pub fn circuit_open<S: Into<String>>(endpoint: S, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            endpoint: endpoint.into(),
            retry_after,
        }
    }

    /// Create an index-not-ready error
    pub fn index_not_ready<S: Into<String>>(msg: S) -> Self {
        Self::IndexNotReady(msg.into())
    }

    /// Create a permission error
    pub fn permission_denied<S: Into<String>>(msg: S) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Normalized kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Transient { .. } | QueryError::Timeout(_) => ErrorKind::Transient,
            QueryError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            QueryError::IndexNotReady(_) => ErrorKind::IndexNotReady,
            _ => ErrorKind::Fatal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if error indicates an access problem
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            QueryError::Authentication(_) | QueryError::PermissionDenied(_)
        )
    }

    /// Map to structured error code
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            QueryError::Transient { .. } => ErrorCode::BackendUnavailable,
            QueryError::Timeout(_) => ErrorCode::BackendTimeout,
            QueryError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            QueryError::IndexNotReady(_) => ErrorCode::IndexNotReady,
            QueryError::Authentication(_) => ErrorCode::InvalidCredentials,
            QueryError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            QueryError::InvalidInput(_) => ErrorCode::InvalidInput,
            QueryError::NotFound(_) => ErrorCode::DocumentNotFound,
            QueryError::Rejected(_) => ErrorCode::RequestRejected,
            QueryError::Config(_) => ErrorCode::ConfigurationInvalid,
            QueryError::Cancelled(_) => ErrorCode::Cancelled,
            QueryError::Json(_) => ErrorCode::ParsingFailed,
            QueryError::Io(_) | QueryError::Generic(_) => ErrorCode::InternalError,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QueryError::Authentication(_) | QueryError::PermissionDenied(_) => {
                ErrorSeverity::Critical
            }
            QueryError::Transient { .. } | QueryError::Timeout(_) => ErrorSeverity::Warning,
            QueryError::CircuitOpen { .. } | QueryError::IndexNotReady(_) => {
                ErrorSeverity::Warning
            }
            QueryError::InvalidInput(_) | QueryError::NotFound(_) => ErrorSeverity::Info,
            QueryError::Cancelled(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// User-facing hint describing what to do next
    pub fn recovery_hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Transient => "The data service is having trouble; retry shortly",
            ErrorKind::CircuitOpen => {
                "The data service is temporarily disabled after repeated failures; wait before retrying"
            }
            ErrorKind::IndexNotReady => {
                "The search index is still being built; try again later or contact the operator"
            }
            ErrorKind::Fatal if self.is_auth_error() => "Sign in again or check your access rights",
            ErrorKind::Fatal => "The request cannot be completed as issued",
        }
    }

    /// Time the caller should wait before retrying, when known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            QueryError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Serializable reason for UI layers
    pub fn reason(&self) -> ErrorReason {
        ErrorReason {
            kind: self.kind(),
            code: self.to_error_code().as_number(),
            message: self.to_string(),
            hint: self.recovery_hint().to_string(),
            retry_after: self.retry_after(),
        }
    }

    /// Create a structured error for logging
    pub fn to_structured_error(&self, component: &str, operation: &str) -> StructuredError {
        let code = self.to_error_code();
        StructuredError {
            code,
            code_number: code.as_number(),
            category: code.category(),
            kind: self.kind(),
            message: self.to_string(),
            is_retryable: self.is_retryable(),
            component: component.to_string(),
            operation: operation.to_string(),
            recovery_hint: self.recovery_hint(),
            severity: self.severity(),
            timestamp: chrono::Utc::now(),
            correlation_id: None,
        }
    }
}

impl From<BackendError> for QueryError {
    fn from(err: BackendError) -> Self {
        let BackendError { code, message } = err;
        match code {
            BackendCode::Unavailable
            | BackendCode::Aborted
            | BackendCode::ResourceExhausted
            | BackendCode::Internal
            | BackendCode::Unknown
            | BackendCode::Cancelled => QueryError::Transient { code, message },
            BackendCode::DeadlineExceeded => QueryError::Timeout(message),
            BackendCode::IndexNotReady => QueryError::IndexNotReady(message),
            BackendCode::Unauthenticated => QueryError::Authentication(message),
            BackendCode::PermissionDenied => QueryError::PermissionDenied(message),
            BackendCode::InvalidArgument => QueryError::InvalidInput(message),
            BackendCode::NotFound => QueryError::NotFound(message),
            BackendCode::FailedPrecondition
            | BackendCode::AlreadyExists
            | BackendCode::DataLoss => QueryError::Rejected(format!("{code}: {message}")),
        }
    }
}

impl From<config::ConfigError> for QueryError {
    fn from(err: config::ConfigError) -> Self {
        QueryError::Config(err.to_string())
    }
}

/// Error logging and reporting utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log a structured error with appropriate severity
    pub fn log_error(error: &QueryError, component: &str, operation: &str) {
        let structured = error.to_structured_error(component, operation);

        match structured.severity {
            ErrorSeverity::Critical | ErrorSeverity::Error => {
                tracing::error!(
                    error_code = structured.code_number,
                    category = structured.category,
                    component = structured.component,
                    operation = structured.operation,
                    "Error occurred: {}",
                    structured.message
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error_code = structured.code_number,
                    category = structured.category,
                    component = structured.component,
                    operation = structured.operation,
                    "Warning: {}",
                    structured.message
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    error_code = structured.code_number,
                    category = structured.category,
                    component = structured.component,
                    operation = structured.operation,
                    "Info: {}",
                    structured.message
                );
            }
        }
    }

    /// Format error for API responses
    pub fn format_api_error(error: &QueryError) -> serde_json::Value {
        let structured = error.to_structured_error("engine", "api");
        serde_json::json!({
            "error": {
                "code": structured.code_number,
                "category": structured.category,
                "kind": structured.kind,
                "message": structured.message,
                "retryable": structured.is_retryable,
                "hint": structured.recovery_hint,
                "timestamp": structured.timestamp
            }
        })
    }
}

/// Macro for easy structured error logging
#[macro_export]
macro_rules! log_structured_error {
    ($error:expr, $component:expr, $operation:expr) => {
        $crate::error::ErrorReporter::log_error(&$error, $component, $operation)
    };
}
