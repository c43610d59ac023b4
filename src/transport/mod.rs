//! Event-loop transport over a serial device.
//!
//! [`SerialTransport`] moves bytes between a [`Device`] and a [`Protocol`]
//! on a single-threaded [`EventLoop`]. Reads are pushed to the protocol as
//! the device becomes readable; writes are buffered and drained as it
//! becomes writable, with pause/resume signaling around the buffer's
//! watermarks. Blocking device work at teardown (flush, close) runs on the
//! loop's executor.
//!
//! Lifecycle: `Open` → `Closing` (after `close`/`abort`) → `Terminating`
//! (the teardown task is running) → `Closed`. `connection_lost` is delivered
//! exactly once.

mod limits;
mod protocol;
mod watch;

pub use limits::{WriteBufferLimits, DEFAULT_HIGH_WATER};
pub use protocol::Protocol;

use crate::config::TransportConfig;
use crate::device::{Device, DeviceError, SharedDevice};
use crate::error::TransportError;
use crate::runtime::{default_exception_handler, run_blocking, EventLoop, ExceptionContext};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use watch::{PollingWatcher, ReadinessWatcher, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Terminating,
    Closed,
}

struct State {
    phase: Phase,
    event_loop: Option<Rc<dyn EventLoop>>,
    protocol: Option<Rc<dyn Protocol>>,
    device: Option<SharedDevice>,
    buffer: VecDeque<Bytes>,
    buffer_size: usize,
    limits: WriteBufferLimits,
    protocol_paused: bool,
    termination_scheduled: bool,
}

struct Inner {
    state: RefCell<State>,
    watcher: Box<dyn Watcher>,
    read_chunk_size: usize,
    name: String,
    peer_addr: Option<SocketAddr>,
}

/// Optional information about a transport, see [`SerialTransport::extra_info`].
#[derive(Clone)]
pub enum ExtraInfo {
    /// The underlying device.
    Serial(SharedDevice),
    /// Remote address of a socket-backed device.
    PeerName(SocketAddr),
}

impl fmt::Debug for ExtraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(device) => match device.try_lock() {
                Some(device) => write!(f, "Serial({})", device.name()),
                None => f.write_str("Serial(<busy>)"),
            },
            Self::PeerName(addr) => write!(f, "PeerName({})", addr),
        }
    }
}

/// Handle to a serial transport. Clones refer to the same transport.
#[derive(Clone)]
pub struct SerialTransport {
    inner: Rc<Inner>,
}

/// Non-owning reference to a [`SerialTransport`].
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<SerialTransport> {
        self.inner.upgrade().map(|inner| SerialTransport { inner })
    }
}

impl SerialTransport {
    /// Wrap an open device with default settings.
    pub fn new(
        event_loop: Rc<dyn EventLoop>,
        protocol: Rc<dyn Protocol>,
        device: Box<dyn Device>,
    ) -> Result<Self, TransportError> {
        Self::with_config(event_loop, protocol, device, &TransportConfig::default())
    }

    /// Wrap an open device.
    ///
    /// Fails on inconsistent watermarks or a zero poll interval. The device
    /// is switched to non-blocking (zero) timeouts. The protocol's
    /// `connection_made` and the start of reading are queued on the loop, in
    /// that order, so neither happens before this returns.
    pub fn with_config(
        event_loop: Rc<dyn EventLoop>,
        protocol: Rc<dyn Protocol>,
        mut device: Box<dyn Device>,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let limits = WriteBufferLimits::new(config.high_water, config.low_water)?;
        if config.poll_interval().is_zero() {
            return Err(TransportError::ZeroPollInterval);
        }
        device.set_timeouts(Duration::ZERO, Duration::ZERO)?;

        let watcher: Box<dyn Watcher> = match device.raw_handle() {
            Some(handle) if event_loop.supports_readiness() => Box::new(ReadinessWatcher::new(handle)),
            _ => Box::new(PollingWatcher::new(config.poll_interval(), config.max_out_waiting)),
        };
        let name = device.name().to_string();
        let peer_addr = device.peer_addr();

        let transport = Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State {
                    phase: Phase::Open,
                    event_loop: Some(event_loop.clone()),
                    protocol: Some(protocol),
                    device: Some(Arc::new(Mutex::new(device))),
                    buffer: VecDeque::new(),
                    buffer_size: 0,
                    limits,
                    protocol_paused: false,
                    termination_scheduled: false,
                }),
                watcher,
                read_chunk_size: config.read_chunk_size.max(1),
                name,
                peer_addr,
            }),
        };
        info!(port = %transport.name(), watcher = transport.inner.watcher.kind(), "Serial transport created");

        let made = transport.clone();
        event_loop.call_soon(Box::new(move || made.notify_connection_made()));
        let reader = transport.downgrade();
        event_loop.call_soon(Box::new(move || {
            if let Some(t) = reader.upgrade() {
                t.ensure_reader();
            }
        }));

        Ok(transport)
    }

    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// The loop driving this transport, until teardown completes.
    pub fn event_loop(&self) -> Option<Rc<dyn EventLoop>> {
        self.inner.state.borrow().event_loop.clone()
    }

    /// The underlying device, until teardown completes.
    pub fn serial(&self) -> Option<SharedDevice> {
        self.inner.state.borrow().device.clone()
    }

    /// Look up optional transport information.
    ///
    /// `"serial"` yields the device and `"peername"` the remote address of a
    /// socket-backed device. Other keys yield `None`.
    pub fn extra_info(&self, key: &str) -> Option<ExtraInfo> {
        match key {
            "serial" => self.serial().map(ExtraInfo::Serial),
            "peername" => self.inner.peer_addr.map(ExtraInfo::PeerName),
            _ => None,
        }
    }

    /// Name of the device, kept after teardown.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True from the first `close`/`abort` on.
    pub fn is_closing(&self) -> bool {
        self.phase() != Phase::Open
    }

    fn phase(&self) -> Phase {
        self.inner.state.borrow().phase
    }

    /// Close gracefully: stop reading, drain buffered data, then deliver
    /// `connection_lost(None)`. Later writes are ignored.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase != Phase::Open {
                return;
            }
            state.phase = Phase::Closing;
        }
        debug!(port = %self.name(), buffered = self.get_write_buffer_size(), "Closing serial transport");
        self.begin_close(None);
    }

    /// Close immediately, dropping buffered data.
    pub fn abort(&self) {
        self.abort_inner(None);
    }

    /// Close immediately and deliver `error` to `connection_lost`.
    pub fn abort_with(&self, error: TransportError) {
        self.abort_inner(Some(error));
    }

    fn abort_inner(&self, error: Option<TransportError>) {
        {
            let mut state = self.inner.state.borrow_mut();
            if matches!(state.phase, Phase::Terminating | Phase::Closed) {
                return;
            }
            state.phase = Phase::Closing;
            state.buffer.clear();
            state.buffer_size = 0;
        }
        debug!(port = %self.name(), error = ?error, "Aborting serial transport");
        self.stop_reader();
        self.stop_writer();
        self.schedule_connection_lost(error);
    }

    /// Stop reading and, once the buffer is empty, stop writing and schedule
    /// teardown. Otherwise the write path finishes the job.
    fn begin_close(&self, error: Option<TransportError>) {
        self.stop_reader();
        if self.get_write_buffer_size() == 0 {
            self.stop_writer();
            self.schedule_connection_lost(error);
        }
    }

    /// Stop delivering data until [`resume_reading`](Self::resume_reading).
    pub fn pause_reading(&self) {
        self.stop_reader();
    }

    /// Deliver data again. Has no effect once closing.
    pub fn resume_reading(&self) {
        self.ensure_reader();
    }

    pub fn is_reading(&self) -> bool {
        self.inner.watcher.is_reading()
    }

    /// Queue `data` for the device. Ignored once closing.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.write_bytes(Bytes::copy_from_slice(data));
    }

    /// Queue an owned chunk for the device without copying it.
    pub fn write_bytes(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase != Phase::Open {
                return;
            }
            state.buffer_size += data.len();
            state.buffer.push_back(data);
        }
        self.ensure_writer();
        self.maybe_pause_protocol();
    }

    /// Serial devices have no end-of-file; this always fails.
    pub fn write_eof(&self) -> Result<(), TransportError> {
        Err(TransportError::EofNotSupported)
    }

    pub fn can_write_eof(&self) -> bool {
        false
    }

    /// Discard buffered data that has not reached the device yet.
    ///
    /// This does not flush the device itself. A transport that was waiting
    /// to drain before closing proceeds to close. On socket-backed devices
    /// (those with a peer address) this is a no-op.
    pub fn flush(&self) {
        if self.inner.peer_addr.is_some() {
            return;
        }
        self.stop_writer();
        {
            let mut state = self.inner.state.borrow_mut();
            state.buffer.clear();
            state.buffer_size = 0;
        }
        self.maybe_resume_protocol();
        if self.phase() == Phase::Closing {
            self.begin_close(None);
        }
    }

    /// Bytes buffered and not yet accepted by the device.
    pub fn get_write_buffer_size(&self) -> usize {
        self.inner.state.borrow().buffer_size
    }

    pub fn write_buffer_limits(&self) -> WriteBufferLimits {
        self.inner.state.borrow().limits
    }

    /// Replace the watermarks, see [`WriteBufferLimits::new`], and pause the
    /// protocol right away if the buffer is already above the new high mark.
    pub fn set_write_buffer_limits(&self, high: Option<usize>, low: Option<usize>) -> Result<(), TransportError> {
        let limits = WriteBufferLimits::new(high, low)?;
        self.inner.state.borrow_mut().limits = limits;
        self.maybe_pause_protocol();
        Ok(())
    }

    fn notify_connection_made(&self) {
        let protocol = self.inner.state.borrow().protocol.clone();
        if let Some(protocol) = protocol {
            protocol.connection_made(self);
        }
    }

    fn live_loop(&self) -> Option<Rc<dyn EventLoop>> {
        let state = self.inner.state.borrow();
        if state.phase != Phase::Open {
            return None;
        }
        state.event_loop.clone()
    }

    fn ensure_reader(&self) {
        let Some(event_loop) = self.live_loop() else {
            return;
        };
        if let Err(e) = self.inner.watcher.start_reading(&event_loop, self.downgrade()) {
            self.fatal_error(e.into(), "Fatal error watching serial device for input");
        }
    }

    fn stop_reader(&self) {
        let event_loop = self.inner.state.borrow().event_loop.clone();
        if let Some(event_loop) = event_loop {
            self.inner.watcher.stop_reading(&*event_loop);
        }
    }

    fn ensure_writer(&self) {
        let Some(event_loop) = self.live_loop() else {
            return;
        };
        if let Err(e) = self.inner.watcher.start_writing(&event_loop, self.downgrade()) {
            self.fatal_error(e.into(), "Fatal error watching serial device for output");
        }
    }

    fn stop_writer(&self) {
        let event_loop = self.inner.state.borrow().event_loop.clone();
        if let Some(event_loop) = event_loop {
            self.inner.watcher.stop_writing(&*event_loop);
        }
    }

    fn device(&self) -> Option<SharedDevice> {
        self.inner.state.borrow().device.clone()
    }

    fn protocol(&self) -> Option<Rc<dyn Protocol>> {
        self.inner.state.borrow().protocol.clone()
    }

    /// Pull one chunk from the device and hand it to the protocol.
    pub(crate) fn read_ready(&self) {
        if self.phase() != Phase::Open {
            return;
        }
        let Some(device) = self.device() else {
            return;
        };
        let mut buffer = vec![0u8; self.inner.read_chunk_size];
        let result = device.lock().read(&mut buffer);
        match result {
            Ok(0) => {}
            Ok(n) => {
                if let Some(protocol) = self.protocol() {
                    protocol.data_received(&buffer[..n]);
                }
            }
            Err(e) if e.is_transient() => {}
            Err(e) if e.is_end_of_stream() => {
                debug!(port = %self.name(), "Peer closed the connection");
                self.close();
            }
            Err(e) => self.fatal_error(e.into(), "Fatal read error on serial transport"),
        }
    }

    /// Push everything buffered to the device in one write.
    pub(crate) fn write_ready(&self) {
        let Some(device) = self.device() else {
            return;
        };
        let data = {
            let mut state = self.inner.state.borrow_mut();
            assert!(state.buffer_size > 0, "write buffer should not be empty");
            let data = if state.buffer.len() == 1 {
                state.buffer.pop_front().unwrap_or_default()
            } else {
                let mut joined = BytesMut::with_capacity(state.buffer_size);
                for chunk in state.buffer.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                joined.freeze()
            };
            state.buffer.clear();
            state.buffer_size = 0;
            data
        };

        let result = device.lock().write(&data);
        match result {
            Err(e) if e.is_transient() => self.requeue(data),
            Err(e) => self.fatal_error(e.into(), "Fatal write error on serial transport"),
            Ok(n) if n >= data.len() => {
                self.stop_writer();
                // May cause further writes.
                self.maybe_resume_protocol();
                // Writing continues after close() until the buffer drains.
                if self.phase() == Phase::Closing && self.get_write_buffer_size() == 0 {
                    self.begin_close(None);
                }
            }
            Ok(n) => {
                self.requeue(data.slice(n..));
                self.maybe_resume_protocol();
                assert!(self.inner.watcher.is_writing(), "writer must stay registered after a partial write");
            }
        }
    }

    fn requeue(&self, data: Bytes) {
        let mut state = self.inner.state.borrow_mut();
        state.buffer_size += data.len();
        state.buffer.push_front(data);
    }

    /// Polling stand-in for a readable event.
    pub(crate) fn poll_read(&self) {
        let Some(device) = self.device() else {
            return;
        };
        let pending = device.lock().bytes_to_read();
        match pending {
            Ok(0) => {}
            Ok(_) => self.read_ready(),
            Err(e) => self.fatal_error(e.into(), "Fatal read error on serial transport"),
        }
    }

    /// Polling stand-in for a writable event; only fires while the driver's
    /// output queue is short.
    pub(crate) fn poll_write(&self, max_out_waiting: usize) {
        let Some(device) = self.device() else {
            return;
        };
        let queued = device.lock().bytes_to_write();
        match queued {
            Ok(n) if n < max_out_waiting => self.write_ready(),
            Ok(_) => {}
            Err(e) => self.fatal_error(e.into(), "Fatal write error on serial transport"),
        }
    }

    fn maybe_pause_protocol(&self) {
        let protocol = {
            let mut state = self.inner.state.borrow_mut();
            if !state.limits.should_pause(state.buffer_size) || state.protocol_paused {
                return;
            }
            state.protocol_paused = true;
            state.protocol.clone()
        };
        if let Some(protocol) = protocol {
            if let Err(e) = protocol.pause_writing() {
                self.report("protocol.pause_writing() failed", e.into());
            }
        }
    }

    fn maybe_resume_protocol(&self) {
        let protocol = {
            let mut state = self.inner.state.borrow_mut();
            if !state.protocol_paused || !state.limits.should_resume(state.buffer_size) {
                return;
            }
            state.protocol_paused = false;
            state.protocol.clone()
        };
        if let Some(protocol) = protocol {
            if let Err(e) = protocol.resume_writing() {
                self.report("protocol.resume_writing() failed", e.into());
            }
        }
    }

    fn report(&self, message: &str, error: TransportError) {
        let (event_loop, protocol) = {
            let state = self.inner.state.borrow();
            (state.event_loop.clone(), state.protocol.clone())
        };
        let context = ExceptionContext {
            message: message.to_string(),
            error: Some(error),
            transport: Some(self.clone()),
            protocol,
        };
        match event_loop {
            Some(event_loop) => event_loop.call_exception_handler(context),
            None => default_exception_handler(&context),
        }
    }

    fn fatal_error(&self, error: TransportError, message: &str) {
        self.report(message, error.clone());
        self.abort_inner(Some(error));
    }

    fn schedule_connection_lost(&self, error: Option<TransportError>) {
        let event_loop = {
            let mut state = self.inner.state.borrow_mut();
            if state.termination_scheduled {
                return;
            }
            state.termination_scheduled = true;
            state.event_loop.clone()
        };
        if let Some(event_loop) = event_loop {
            let transport = self.clone();
            event_loop.spawn_local(Box::pin(transport.call_connection_lost(error)));
        }
    }

    async fn call_connection_lost(self, error: Option<TransportError>) {
        let (event_loop, device, protocol) = {
            let mut state = self.inner.state.borrow_mut();
            assert_eq!(state.phase, Phase::Closing, "teardown started while not closing");
            state.phase = Phase::Terminating;
            (state.event_loop.clone(), state.device.clone(), state.protocol.clone())
        };
        assert!(!self.inner.watcher.is_reading(), "reader still registered at teardown");
        assert!(!self.inner.watcher.is_writing(), "writer still registered at teardown");
        let (Some(event_loop), Some(device)) = (event_loop, device) else {
            return;
        };

        let flushing = device.clone();
        match run_blocking(&*event_loop, move || flushing.lock().flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_disconnected() => {
                debug!(port = %self.name(), error = %e, "Ignoring flush error from a vanished device");
            }
            Ok(Err(e)) => self.report("Failed to flush serial device during close", e.into()),
            Err(e) => self.report("Failed to flush serial device during close", e),
        }

        let outcome = match &protocol {
            Some(protocol) => panic::catch_unwind(AssertUnwindSafe(|| protocol.connection_lost(error))),
            None => Ok(()),
        };

        {
            let mut state = self.inner.state.borrow_mut();
            state.buffer.clear();
            state.buffer_size = 0;
        }
        let closing = device.clone();
        match run_blocking(&*event_loop, move || closing.lock().close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_close_error(self.name(), &e),
            Err(e) => warn!(port = %self.name(), error = %e, "Device close did not complete"),
        }

        {
            let mut state = self.inner.state.borrow_mut();
            state.device = None;
            state.protocol = None;
            state.event_loop = None;
            state.phase = Phase::Closed;
        }
        drop(protocol);
        info!(port = %self.name(), "Serial transport closed");

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }
}

fn log_close_error(port: &str, error: &DeviceError) {
    if error.is_disconnected() {
        debug!(port = %port, error = %error, "Ignoring close error from a vanished device");
    } else {
        warn!(port = %port, error = %error, "Failed to close serial device");
    }
}

impl fmt::Display for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialTransport({})", self.inner.name)
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("SerialTransport");
        out.field("name", &self.inner.name)
            .field("watcher", &self.inner.watcher.kind());
        if let Ok(state) = self.inner.state.try_borrow() {
            out.field("phase", &state.phase)
                .field("buffered", &state.buffer_size)
                .field("limits", &state.limits)
                .field("protocol_paused", &state.protocol_paused);
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use crate::runtime::ManualLoop;
    use std::cell::Cell;

    #[derive(Default)]
    struct Counting {
        made: Cell<usize>,
        lost: Cell<usize>,
    }

    impl Protocol for Counting {
        fn connection_made(&self, _transport: &SerialTransport) {
            self.made.set(self.made.get() + 1);
        }

        fn connection_lost(&self, _error: Option<TransportError>) {
            self.lost.set(self.lost.get() + 1);
        }
    }

    fn setup(device: MockDevice) -> (Rc<ManualLoop>, Rc<Counting>, SerialTransport) {
        let lp = Rc::new(ManualLoop::new());
        let protocol = Rc::new(Counting::default());
        let transport = SerialTransport::new(lp.clone(), protocol.clone(), Box::new(device)).unwrap();
        (lp, protocol, transport)
    }

    #[test]
    fn test_construction_defers_callbacks() {
        let device = MockDevice::new("MOCK0");
        let (lp, protocol, transport) = setup(device.clone());

        assert_eq!(protocol.made.get(), 0);
        assert!(!transport.is_reading());
        assert_eq!(device.timeouts(), Some((Duration::ZERO, Duration::ZERO)));

        lp.run_until_idle();
        assert_eq!(protocol.made.get(), 1);
        assert!(transport.is_reading());
        assert!(lp.has_reader(7));
    }

    #[test]
    fn test_watcher_selection() {
        let (_lp, _p, transport) = setup(MockDevice::new("MOCK0"));
        assert_eq!(transport.inner.watcher.kind(), "readiness");

        let (_lp, _p, transport) = setup(MockDevice::without_handle("MOCK1"));
        assert_eq!(transport.inner.watcher.kind(), "polling");

        let lp = Rc::new(ManualLoop::polling());
        let transport = SerialTransport::new(
            lp,
            Rc::new(Counting::default()),
            Box::new(MockDevice::new("MOCK2")),
        )
        .unwrap();
        assert_eq!(transport.inner.watcher.kind(), "polling");
    }

    #[test]
    fn test_double_close_and_abort_lose_connection_once() {
        let (lp, protocol, transport) = setup(MockDevice::new("MOCK0"));
        lp.run_until_idle();

        transport.close();
        transport.close();
        transport.abort();
        lp.run_until_idle();

        assert_eq!(protocol.lost.get(), 1);
        assert!(transport.serial().is_none());
        assert!(transport.event_loop().is_none());
        assert!(transport.is_closing());
    }

    #[test]
    fn test_display_and_debug() {
        let (_lp, _p, transport) = setup(MockDevice::new("MOCK0"));
        assert_eq!(transport.to_string(), "SerialTransport(MOCK0)");
        let debug = format!("{:?}", transport);
        assert!(debug.contains("Open"));
        assert!(debug.contains("readiness"));
    }

    #[test]
    fn test_weak_transport_does_not_keep_alive() {
        let lp = Rc::new(ManualLoop::new());
        let transport = SerialTransport::new(
            lp.clone(),
            Rc::new(Counting::default()),
            Box::new(MockDevice::new("MOCK0")),
        )
        .unwrap();
        let weak = transport.downgrade();
        assert!(weak.upgrade().is_some());

        lp.run_until_idle();
        drop(transport);
        assert!(weak.upgrade().is_none());
        // The stale reader must not resurrect anything.
        assert!(lp.fire_readable(7));
    }
}
