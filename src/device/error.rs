//! Device-level error types.
//!
//! Kept separate from transport errors so device implementations do not need
//! to know anything about the event loop or the protocol layer.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while operating a device.
///
/// The type is `Clone` because one error is both reported to the loop's
/// exception handler and delivered to `connection_lost`.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The specified device was not found on the system.
    #[error("Serial device not found: {0}")]
    NotFound(String),

    /// An I/O error occurred during device operations.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Device configuration failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The device has already been closed.
    #[error("Device is not open")]
    NotOpen,

    /// The far end closed a stream-backed device.
    #[error("Peer closed the connection")]
    EndOfStream,

    /// A serialport-specific error occurred.
    #[error("Serial port error: {description}")]
    Serial {
        kind: serialport::ErrorKind,
        description: String,
    },
}

impl DeviceError {
    /// Create a NotFound error from a device name.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a Config error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The `io::ErrorKind` behind this error, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            Self::Serial {
                kind: serialport::ErrorKind::Io(kind),
                ..
            } => Some(*kind),
            _ => None,
        }
    }

    /// True when the device simply cannot make progress right now.
    ///
    /// These conditions are retried by the transport and never surface to
    /// the protocol.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut)
        )
    }

    /// True when a stream-backed device reached a clean end of input.
    ///
    /// The transport closes gracefully instead of treating this as fatal.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// True when the error means the device went away underneath us
    /// (hot-unplug, peer reset).
    ///
    /// Teardown ignores exactly this class of error and nothing else.
    pub fn is_disconnected(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::EndOfStream => true,
            Self::Serial {
                kind: serialport::ErrorKind::NoDevice,
                ..
            } => true,
            Self::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotFound
                ) || vanished_os_error(e.raw_os_error())
            }
            _ => false,
        }
    }
}

#[cfg(unix)]
fn vanished_os_error(code: Option<i32>) -> bool {
    matches!(
        code,
        Some(libc::ENXIO | libc::ENODEV | libc::EIO | libc::ENOTTY)
    )
}

#[cfg(not(unix))]
fn vanished_os_error(_code: Option<i32>) -> bool {
    false
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serialport::Error> for DeviceError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::Io(kind) => Self::Io(Arc::new(io::Error::new(kind, err.description))),
            kind => Self::Serial {
                kind,
                description: err.description,
            },
        }
    }
}
