//! Callbacks a transport delivers to the code using it.

use super::SerialTransport;
use crate::error::{ProtocolError, TransportError};

/// Receiver of transport events.
///
/// All methods run on the loop thread and take `&self`; implementations keep
/// their own state in `Cell`/`RefCell`. A protocol may call back into the
/// transport from any of these methods.
///
/// Call order: `connection_made` once, then any number of `data_received`,
/// `pause_writing` and `resume_writing`, then `connection_lost` exactly once.
pub trait Protocol {
    /// The transport is ready. Keep a clone of it to write later.
    fn connection_made(&self, _transport: &SerialTransport) {}

    fn data_received(&self, _data: &[u8]) {}

    /// The write buffer went above the high-water mark.
    ///
    /// An error is reported to the loop's exception handler and otherwise
    /// ignored.
    fn pause_writing(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// The write buffer drained to the low-water mark.
    fn resume_writing(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// The transport is gone. `None` means a regular close.
    fn connection_lost(&self, _error: Option<TransportError>) {}
}
