//! Mock device implementation for testing.
//!
//! Provides a `MockDevice` that simulates a serial port without requiring
//! hardware. Clones share state, so a test can keep one handle for scripting
//! and inspection while the transport owns the other.

use super::error::DeviceError;
use super::traits::{Device, RawHandle};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Inner state of the mock device, protected by a mutex for interior mutability.
#[derive(Debug, Default)]
struct MockDeviceState {
    /// Bytes to be returned by read operations.
    read_queue: VecDeque<u8>,
    /// Every successful write call, in order.
    write_log: Vec<Vec<u8>>,
    /// Upper bound on bytes accepted per write call; `None` accepts everything.
    write_capacity: Option<usize>,
    /// Results to return from the next read calls instead of reading.
    read_failures: VecDeque<DeviceError>,
    /// Results to return from the next write calls instead of writing.
    write_failures: VecDeque<DeviceError>,
    /// Error returned by the next flush.
    flush_failure: Option<DeviceError>,
    /// Reported output queue length.
    out_waiting: usize,
    /// Last timeouts configured by the transport.
    timeouts: Option<(Duration, Duration)>,
    flush_count: usize,
    write_calls: usize,
    closed: bool,
}

/// Mock device for testing transports.
///
/// # Example
/// ```
/// use serial_transport::device::{Device, MockDevice};
///
/// let mut device = MockDevice::new("MOCK0");
/// device.enqueue_read(b"Hello");
///
/// let mut buffer = [0u8; 16];
/// let n = device.read(&mut buffer).unwrap();
/// assert_eq!(&buffer[..n], b"Hello");
///
/// device.write(b"Response").unwrap();
/// assert_eq!(device.written(), b"Response");
/// ```
#[derive(Clone)]
pub struct MockDevice {
    name: String,
    handle: Option<RawHandle>,
    peer: Option<SocketAddr>,
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockDevice {
    /// Create a mock with a fake readiness handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_handle(name, Some(7))
    }

    /// Create a mock that has no readiness handle, forcing timed polling.
    pub fn without_handle(name: impl Into<String>) -> Self {
        Self::with_handle(name, None)
    }

    /// Create a mock with an explicit readiness handle.
    pub fn with_handle(name: impl Into<String>, handle: Option<RawHandle>) -> Self {
        Self {
            name: name.into(),
            handle,
            peer: None,
            state: Arc::new(Mutex::new(MockDeviceState::default())),
        }
    }

    /// Report `peer` as the remote address, like a socket-backed device.
    pub fn with_peer_addr(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockDeviceState> {
        // A panicking test must not take the other handle down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue bytes to be returned by subsequent reads.
    pub fn enqueue_read(&self, data: &[u8]) {
        self.state().read_queue.extend(data);
    }

    /// Make the next read fail with `error`.
    pub fn fail_next_read(&self, error: DeviceError) {
        self.state().read_failures.push_back(error);
    }

    /// Make the next write fail with `error`.
    pub fn fail_next_write(&self, error: DeviceError) {
        self.state().write_failures.push_back(error);
    }

    /// Make the next write report that the device would block.
    pub fn block_next_write(&self) {
        self.fail_next_write(io::Error::from(io::ErrorKind::WouldBlock).into());
    }

    /// Make the next flush fail with `error`.
    pub fn fail_flush(&self, error: DeviceError) {
        self.state().flush_failure = Some(error);
    }

    /// Limit how many bytes a single write call accepts.
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.state().write_capacity = capacity;
    }

    /// Set the output queue length reported to polling transports.
    pub fn set_out_waiting(&self, bytes: usize) {
        self.state().out_waiting = bytes;
    }

    /// All bytes accepted so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.state().write_log.concat()
    }

    /// A copy of every accepted write call.
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.state().write_log.clone()
    }

    /// Number of write calls, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.state().write_calls
    }

    /// Number of flush calls.
    pub fn flush_count(&self) -> usize {
        self.state().flush_count
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Timeouts last configured through `set_timeouts`.
    pub fn timeouts(&self) -> Option<(Duration, Duration)> {
        self.state().timeouts
    }

    /// Get the number of bytes available to read.
    pub fn available_bytes(&self) -> usize {
        self.state().read_queue.len()
    }
}

impl Device for MockDevice {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError> {
        let mut state = self.state();
        if state.closed {
            return Err(DeviceError::NotOpen);
        }
        if let Some(error) = state.read_failures.pop_front() {
            return Err(error);
        }

        let n = buffer.len().min(state.read_queue.len());
        for (slot, byte) in buffer.iter_mut().zip(state.read_queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let mut state = self.state();
        state.write_calls += 1;
        if state.closed {
            return Err(DeviceError::NotOpen);
        }
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }

        let n = state.write_capacity.map_or(data.len(), |cap| cap.min(data.len()));
        if n == 0 && !data.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
        }
        state.write_log.push(data[..n].to_vec());
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.flush_count += 1;
        match state.flush_failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.closed {
            return Err(DeviceError::NotOpen);
        }
        state.closed = true;
        Ok(())
    }

    fn set_timeouts(&mut self, read: Duration, write: Duration) -> Result<(), DeviceError> {
        self.state().timeouts = Some((read, write));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn raw_handle(&self) -> Option<RawHandle> {
        self.handle
    }

    fn bytes_to_read(&self) -> Result<usize, DeviceError> {
        Ok(self.state().read_queue.len())
    }

    fn bytes_to_write(&self) -> Result<usize, DeviceError> {
        Ok(self.state().out_waiting)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("name", &self.name)
            .field("available_bytes", &self.available_bytes())
            .finish()
    }
}
