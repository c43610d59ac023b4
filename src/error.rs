//! Transport-level error type.

use crate::device::DeviceError;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by protocol flow-control callbacks.
pub type ProtocolError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the transport and the connection helpers.
///
/// `Clone` so the same error can go to the exception handler and to
/// `connection_lost`.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The device failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Write buffer limits were inconsistent.
    #[error("high ({high}) must be >= low ({low}) must be >= 0")]
    InvalidWriteBufferLimits { high: usize, low: usize },

    /// A polling transport would re-arm without ever yielding.
    #[error("Poll interval must be non-zero")]
    ZeroPollInterval,

    /// Serial devices have no end-of-file to send.
    #[error("Serial connections do not support end-of-file")]
    EofNotSupported,

    /// The device locator could not be understood.
    #[error("Invalid device locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    /// A protocol callback reported a failure.
    #[error("Protocol callback failed: {0}")]
    Protocol(Arc<dyn std::error::Error + Send + Sync>),

    /// A blocking job finished without handing back its result.
    #[error("Background task ended without a result")]
    BackgroundTaskLost,
}

impl TransportError {
    pub(crate) fn invalid_locator(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// The device error behind this error, if any.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            Self::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(Arc::from(err))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Device(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_message() {
        let err = TransportError::InvalidWriteBufferLimits { high: 1, low: 2 };
        assert_eq!(err.to_string(), "high (1) must be >= low (2) must be >= 0");
    }

    #[test]
    fn test_device_error_is_transparent() {
        let err: TransportError = DeviceError::not_found("COM3").into();
        assert_eq!(err.to_string(), "Serial device not found: COM3");
        assert!(err.device_error().is_some());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: TransportError = ProtocolError::from("listener gone").into();
        assert_eq!(err.to_string(), "Protocol callback failed: listener gone");
        assert!(err.device_error().is_none());
    }
}
