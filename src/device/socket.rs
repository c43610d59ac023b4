//! TCP-bridged serial device (`socket://host:port`).
//!
//! Serial-over-TCP bridges and test harnesses expose a raw byte stream on a
//! socket. Presenting it as a `Device` lets the regular transport drive it,
//! so both kinds of connection share one surface.

use super::error::DeviceError;
use super::traits::{Device, RawHandle};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// A non-blocking TCP stream acting as a serial device.
pub struct SocketDevice {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    name: String,
}

impl SocketDevice {
    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, DeviceError> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .map(DeviceError::from)
            .unwrap_or_else(|| DeviceError::not_found(format!("{host}:{port}"))))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, DeviceError> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            peer,
            name: format!("socket://{peer}"),
        })
    }

    fn stream(&self) -> Result<&TcpStream, DeviceError> {
        self.stream.as_ref().ok_or(DeviceError::NotOpen)
    }
}

impl Device for SocketDevice {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError> {
        let mut stream = self.stream()?;
        match stream.read(buffer) {
            Ok(0) if !buffer.is_empty() => Err(DeviceError::EndOfStream),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let mut stream = self.stream()?;
        stream.write(data).map_err(DeviceError::from)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        // Nothing is buffered below the kernel socket.
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream.take().ok_or(DeviceError::NotOpen)?;
        match stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn set_timeouts(&mut self, _read: Duration, _write: Duration) -> Result<(), DeviceError> {
        // Already non-blocking.
        self.stream().map(|_| ())
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn raw_handle(&self) -> Option<RawHandle> {
        use std::os::unix::io::AsRawFd;
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn bytes_to_read(&self) -> Result<usize, DeviceError> {
        let mut probe = [0u8; 1];
        match self.stream()?.peek(&mut probe) {
            // Report the pending EOF as readable so the read path sees it.
            Ok(_) => Ok(1),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn bytes_to_write(&self) -> Result<usize, DeviceError> {
        self.stream().map(|_| 0)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

impl std::fmt::Debug for SocketDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketDevice")
            .field("peer", &self.peer)
            .field("open", &self.stream.is_some())
            .finish()
    }
}
