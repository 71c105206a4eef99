//! Unified error handling for pumpsrv services
//!
//! Service binaries surface a single [`ServiceError`] at their outer boundary,
//! while library crates keep their own domain error types and expose a common
//! interface through [`ServiceErrorTrait`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ErrorInfo - published error description
// ============================================================================

/// Serializable error description, suitable for state snapshots and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `PORT_UNRESPONSIVE`)
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ErrorInfo {
    /// Create a new ErrorInfo with a code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// ServiceError - Main error type
// ============================================================================

/// Main error type for service binaries
#[derive(Debug, Error)]
pub enum ServiceError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Device & Communication Errors
    // ======================================
    #[error("Device error: {device}: {message}")]
    Device { device: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for service binaries
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ServiceError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// ============================================================================
// Error categories and the shared error trait
// ============================================================================

/// Coarse error classification used for retry and log-level decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Protocol,
    Connection,
    Timeout,
    Device,
    Io,
    Internal,
}

/// Common error interface
///
/// Each crate keeps its own domain error enum and implements this trait to
/// gain shared retry, logging and reporting behaviour.
pub trait ServiceErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and published state)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Timeout | ErrorCategory::Connection | ErrorCategory::Io
        )
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Io => Level::ERROR,
            ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol
            | ErrorCategory::Device => Level::WARN,
            ErrorCategory::Configuration | ErrorCategory::Validation => Level::INFO,
        }
    }

    /// Build a serializable description of this error
    fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.error_code(), self.to_string())
    }
}

impl ServiceErrorTrait for ServiceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Device { .. } => "DEVICE_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Device { .. } => ErrorCategory::Device,
            Self::Communication(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Io(_) => ErrorCategory::Io,
            Self::Serialization(_) => ErrorCategory::Validation,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ServiceError::configuration("bad").error_code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(
            ServiceError::invalid_config("address", "out of range").error_code(),
            "INVALID_CONFIG"
        );
        assert_eq!(ServiceError::internal("x").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_error_retryable() {
        assert!(ServiceError::Timeout("pump".into()).is_retryable());
        assert!(ServiceError::Communication("line".into()).is_retryable());
        assert!(!ServiceError::configuration("bad").is_retryable());
        assert!(!ServiceError::device("pump-a", "stall").is_retryable());
    }

    #[test]
    fn test_error_info() {
        let error = ServiceError::invalid_config("address", "must be 0-9");
        let info = error.to_error_info();
        assert_eq!(info.code, "INVALID_CONFIG");
        assert!(info.message.contains("must be 0-9"));

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"code\":\"INVALID_CONFIG\""));
    }

    #[test]
    fn test_io_conversion() {
        let err: ServiceError = std::io::Error::other("port vanished").into();
        assert_eq!(err.category(), ErrorCategory::Io);
        assert_eq!(err.log_level(), tracing::Level::ERROR);
    }
}
