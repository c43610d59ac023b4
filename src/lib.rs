//! Serial Transport Library
//!
//! Bridges a serial device into a single-threaded event loop. Protocol code
//! sees a duplex byte stream: data arrives through callbacks, writes are
//! buffered and drained asynchronously, and watermark-based flow control
//! keeps a fast writer from growing the buffer without bound.
//!
//! # Modules
//!
//! - `device`: Device abstraction (native serial ports, `socket://` bridges, mocks)
//! - `runtime`: Event loop capability set and the bundled loops
//! - `transport`: The transport state machine and the `Protocol` callbacks
//! - `connection`: Opening devices and wiring them to protocols
//! - `timeout`: Bounded-time accumulation reads
//! - `config`: Configuration management with TOML support
//! - `error`: Transport error type
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_transport::{create_serial_connection, PortConfiguration, Protocol, SerialTransport, TokioEventLoop};
//! use std::rc::Rc;
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn data_received(&self, data: &[u8]) {
//!         println!("received {:?}", data);
//!     }
//! }
//!
//! # async fn demo() -> Result<(), serial_transport::TransportError> {
//! // Inside a tokio LocalSet:
//! let event_loop = Rc::new(TokioEventLoop::new());
//! let (transport, _protocol) = create_serial_connection(
//!     event_loop,
//!     || Rc::new(Echo),
//!     "/dev/ttyUSB0",
//!     &PortConfiguration::default(),
//! )
//! .await?;
//! transport.write(b"AT\r\n");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod runtime;
pub mod timeout;
pub mod transport;

// Re-export commonly used types for convenience
pub use connection::{
    connection_for_device, connection_for_device_with_config, create_serial_connection,
    create_serial_connection_with_config, Locator,
};
pub use device::{
    DataBits, Device, DeviceError, FlowControl, MockDevice, Parity, PortConfiguration,
    SerialDevice, SharedDevice, SocketDevice, StopBits,
};
pub use error::{ProtocolError, TransportError};
pub use runtime::{EventLoop, ExceptionContext, ManualLoop, TimerHandle, TokioEventLoop};
pub use timeout::{read_with_timeout, ReadSome};
pub use transport::{ExtraInfo, Protocol, SerialTransport, WeakTransport, WriteBufferLimits};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult, TransportConfig};
