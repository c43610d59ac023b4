//! The device capability set the transport drives.
//!
//! Defines the `Device` trait that lets real serial ports, TCP bridges and
//! mock implementations be used interchangeably, plus the open-time
//! configuration for physical ports.

use super::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Handle used to register a device with an event loop for readiness events.
///
/// On unix this is the file descriptor.
pub type RawHandle = i32;

/// A device shared between the transport and blocking teardown jobs.
///
/// The transport is the only owner in practice; the mutex exists because
/// flush and close run on the blocking pool.
pub type SharedDevice = Arc<parking_lot::Mutex<Box<dyn Device>>>;

/// Configuration parameters used when opening a serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfiguration {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Number of data bits (5, 6, 7, or 8).
    pub data_bits: DataBits,

    /// Flow control mode.
    pub flow_control: FlowControl,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Timeout for the open itself (and the TCP connect of socket locators).
    ///
    /// The transport switches the device to zero timeouts once it owns it.
    pub timeout: Duration,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Byte-level device operations.
///
/// Every method is expected to return promptly once `set_timeouts` has been
/// called with zero durations; `flush` and `close` may block and are only
/// ever invoked from the blocking pool.
pub trait Device: Send + std::fmt::Debug {
    /// Read up to `buffer.len()` bytes.
    ///
    /// `Ok(0)` means nothing was available; devices have no end-of-stream.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError>;

    /// Write a prefix of `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// Wait until everything handed to the driver has been transmitted.
    fn flush(&mut self) -> Result<(), DeviceError>;

    /// Release the underlying OS resource. Later calls fail with `NotOpen`.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Set read and write timeouts. Zero means non-blocking.
    fn set_timeouts(&mut self, read: Duration, write: Duration) -> Result<(), DeviceError>;

    /// Get the name/path of this device.
    fn name(&self) -> &str;

    /// Handle for readiness registration, if the platform has one.
    ///
    /// Returning `None` makes the transport fall back to timed polling.
    fn raw_handle(&self) -> Option<RawHandle> {
        None
    }

    /// Bytes waiting in the input queue.
    fn bytes_to_read(&self) -> Result<usize, DeviceError>;

    /// Bytes waiting in the output queue.
    fn bytes_to_write(&self) -> Result<usize, DeviceError>;

    /// Remote address for network-bridged devices.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
