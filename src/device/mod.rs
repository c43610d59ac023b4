//! Device abstraction layer.
//!
//! Provides the `Device` trait the transport drives, plus implementations for
//! native serial ports, TCP-bridged ports and a scriptable mock.

pub mod error;
pub mod mock;
pub mod serial;
pub mod socket;
pub mod traits;

pub use error::DeviceError;
pub use mock::MockDevice;
pub use serial::SerialDevice;
pub use socket::SocketDevice;
pub use traits::*;
