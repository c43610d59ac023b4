//! Physical serial port device.
//!
//! Wraps the platform-native port from the `serialport` crate so the
//! transport can register its file descriptor for readiness events.

use super::error::DeviceError;
use super::traits::{Device, PortConfiguration, RawHandle};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

#[cfg(unix)]
type NativePort = serialport::TTYPort;

#[cfg(windows)]
type NativePort = serialport::COMPort;

/// A serial port opened through `serialport`.
pub struct SerialDevice {
    /// The native port; `None` once closed.
    port: Option<NativePort>,
    /// The port name/path for identification.
    name: String,
}

impl SerialDevice {
    /// Open a serial port with the given configuration.
    ///
    /// This call may block while the driver negotiates with the hardware, so
    /// the connection helpers run it on the blocking pool.
    ///
    /// # Example
    /// ```no_run
    /// use serial_transport::device::{PortConfiguration, SerialDevice};
    ///
    /// let device = SerialDevice::open("/dev/ttyUSB0", &PortConfiguration::default())?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(port_name: &str, config: &PortConfiguration) -> Result<Self, DeviceError> {
        let port = serialport::new(port_name, config.baud_rate)
            .data_bits(config.data_bits.into())
            .flow_control(config.flow_control.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .timeout(config.timeout)
            .open_native()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => DeviceError::not_found(port_name),
                serialport::ErrorKind::InvalidInput => DeviceError::config(e.to_string()),
                _ => DeviceError::from(e),
            })?;

        debug!("Opened serial port {} at {} baud", port_name, config.baud_rate);

        Ok(Self {
            port: Some(port),
            name: port_name.to_string(),
        })
    }

    fn port(&self) -> Result<&NativePort, DeviceError> {
        self.port.as_ref().ok_or(DeviceError::NotOpen)
    }

    fn port_mut(&mut self) -> Result<&mut NativePort, DeviceError> {
        self.port.as_mut().ok_or(DeviceError::NotOpen)
    }
}

impl Device for SerialDevice {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError> {
        match self.port_mut()?.read(buffer) {
            Ok(n) => Ok(n),
            // A zero timeout reports "nothing yet" as TimedOut.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        self.port_mut()?.write(data).map_err(DeviceError::from)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.port_mut()?.flush().map_err(DeviceError::from)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        // Dropping the native port closes the descriptor.
        self.port.take().map(drop).ok_or(DeviceError::NotOpen)
    }

    fn set_timeouts(&mut self, read: Duration, write: Duration) -> Result<(), DeviceError> {
        // serialport has a single timeout for both directions.
        self.port_mut()?
            .set_timeout(read.min(write))
            .map_err(DeviceError::from)
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn raw_handle(&self) -> Option<RawHandle> {
        use std::os::unix::io::AsRawFd;
        self.port.as_ref().map(|p| p.as_raw_fd())
    }

    fn bytes_to_read(&self) -> Result<usize, DeviceError> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn bytes_to_write(&self) -> Result<usize, DeviceError> {
        Ok(self.port()?.bytes_to_write()? as usize)
    }
}

impl std::fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDevice")
            .field("name", &self.name)
            .field("baud_rate", &self.port.as_ref().and_then(|p| p.baud_rate().ok()))
            .field("open", &self.port.is_some())
            .finish()
    }
}
