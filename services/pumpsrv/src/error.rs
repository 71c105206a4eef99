//! Error handling for the pump service
//!
//! [`DecodeError`] never leaves the dispatcher's reader loop; it exists so
//! malformed frames can be logged and counted. Everything a caller can see
//! is a [`PumpError`].

use std::time::Duration;

use errors::{ErrorCategory, ServiceError, ServiceErrorTrait};
use thiserror::Error;

/// Malformed inbound frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Frame exceeds {0} bytes without terminator")]
    Overlong(usize),

    #[error("Non-numeric address: {0:?}")]
    InvalidAddress(String),

    #[error("Address {0} out of range 0-9")]
    AddressOutOfRange(u8),

    #[error("Alarm frame without alarm code")]
    MissingAlarmCode,

    #[error("Frame is not printable ASCII")]
    NotAscii,
}

/// Pump service error type
#[derive(Error, Debug, Clone)]
pub enum PumpError {
    /// Malformed frame (only surfaced by explicit decode calls)
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Device rejected a command (`?`, `NA`, `OOR`, `COM`, `IGN`)
    #[error("Protocol error from address {address}: {code}")]
    Protocol { address: String, code: String },

    /// Invalid configuration, fatal at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Value not representable on the wire or outside limits
    #[error("Value error: {0}")]
    Value(String),

    /// No frame arrived within the read timeout after a command was sent
    #[error("Port {port} unresponsive for {timeout:?}")]
    PortUnresponsive { port: String, timeout: Duration },

    /// Bounded query retry exhausted
    #[error("Query {query} failed after {attempts} attempts")]
    QueryFailed { query: String, attempts: u32 },

    /// Serial port or stream failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Dispatcher has been closed
    #[error("Dispatcher closed: {0}")]
    Closed(String),
}

/// Result type alias for the pump service
pub type Result<T> = std::result::Result<T, PumpError>;

impl PumpError {
    pub fn config(msg: impl Into<String>) -> Self {
        PumpError::Configuration(msg.into())
    }

    pub fn value(msg: impl Into<String>) -> Self {
        PumpError::Value(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        PumpError::Transport(msg.into())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for PumpError {
    fn from(err: std::io::Error) -> Self {
        PumpError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for PumpError {
    fn from(err: tokio_serial::Error) -> Self {
        PumpError::Transport(err.to_string())
    }
}

impl From<figment::Error> for PumpError {
    fn from(err: figment::Error) -> Self {
        PumpError::Configuration(err.to_string())
    }
}

// ============================================================================
// Shared error interface
// ============================================================================

impl ServiceErrorTrait for PumpError {
    fn error_code(&self) -> &'static str {
        match self {
            PumpError::Decode(_) => "DECODE_ERROR",
            PumpError::Protocol { .. } => "PROTOCOL_ERROR",
            PumpError::Configuration(_) => "CONFIGURATION_ERROR",
            PumpError::Value(_) => "VALUE_ERROR",
            PumpError::PortUnresponsive { .. } => "PORT_UNRESPONSIVE",
            PumpError::QueryFailed { .. } => "QUERY_FAILED",
            PumpError::Transport(_) => "TRANSPORT_ERROR",
            PumpError::Closed(_) => "DISPATCHER_CLOSED",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            PumpError::Decode(_) | PumpError::Protocol { .. } => ErrorCategory::Protocol,
            PumpError::Configuration(_) => ErrorCategory::Configuration,
            PumpError::Value(_) => ErrorCategory::Validation,
            PumpError::PortUnresponsive { .. } | PumpError::QueryFailed { .. } => {
                ErrorCategory::Timeout
            },
            PumpError::Transport(_) => ErrorCategory::Connection,
            PumpError::Closed(_) => ErrorCategory::Internal,
        }
    }
}

impl From<PumpError> for ServiceError {
    fn from(err: PumpError) -> Self {
        match err {
            PumpError::Configuration(msg) => ServiceError::Configuration(msg),
            PumpError::Value(msg) => ServiceError::invalid_config("value", msg),
            PumpError::Transport(msg) => ServiceError::Communication(msg),
            PumpError::PortUnresponsive { port, .. } => ServiceError::Timeout(port),
            PumpError::Protocol { address, code } => ServiceError::device(address, code),
            other => ServiceError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_categories() {
        let err = PumpError::PortUnresponsive {
            port: "/dev/ttyUSB0".into(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(err.error_code(), "PORT_UNRESPONSIVE");
        assert!(err.is_retryable());

        let err = PumpError::value("volume 123456 does not fit");
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: PumpError = DecodeError::AddressOutOfRange(12).into();
        assert_eq!(err.error_code(), "DECODE_ERROR");
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_service_error_conversion() {
        let err: ServiceError = PumpError::config("address 10 out of range").into();
        assert!(matches!(err, ServiceError::Configuration(_)));

        let err: ServiceError = PumpError::transport("port vanished").into();
        assert!(matches!(err, ServiceError::Communication(_)));

        let err: ServiceError = PumpError::Protocol {
            address: "03".into(),
            code: "OOR".into(),
        }
        .into();
        assert_eq!(err.error_code(), "DEVICE_ERROR");
        assert!(err.to_string().contains("03: OOR"));
    }
}
