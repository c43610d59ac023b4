//! Shared test utilities for transport tests.
//!
//! This module provides:
//! - `RecordingProtocol`, a protocol that logs every callback
//! - `Harness`, a transport wired to a `ManualLoop` and a `MockDevice`

#![allow(dead_code)]

use serial_transport::config::TransportConfig;
use serial_transport::device::MockDevice;
use serial_transport::{ManualLoop, Protocol, ProtocolError, SerialTransport, TransportError};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Readiness handle the mock device reports.
pub const HANDLE: i32 = 7;

/// One protocol callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Made,
    Data(Vec<u8>),
    Pause,
    Resume,
    /// `connection_lost`, with the error rendered as text.
    Lost(Option<String>),
}

/// Protocol that records callbacks and can be told to misbehave.
#[derive(Debug, Default)]
pub struct RecordingProtocol {
    events: RefCell<Vec<Event>>,
    transport: RefCell<Option<SerialTransport>>,
    lost_error: RefCell<Option<TransportError>>,
    pub fail_pause: Cell<bool>,
    pub fail_resume: Cell<bool>,
    pub panic_on_lost: Cell<bool>,
    /// Close the transport as soon as a newline arrives.
    pub close_on_newline: Cell<bool>,
}

impl RecordingProtocol {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Everything delivered through `data_received`, concatenated.
    pub fn received(&self) -> Vec<u8> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Data(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn count(&self, wanted: fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| wanted(e)).count()
    }

    pub fn pauses(&self) -> usize {
        self.count(|e| matches!(e, Event::Pause))
    }

    pub fn resumes(&self) -> usize {
        self.count(|e| matches!(e, Event::Resume))
    }

    pub fn losses(&self) -> usize {
        self.count(|e| matches!(e, Event::Lost(_)))
    }

    /// The error handed to `connection_lost`, if it has been called with one.
    pub fn lost_error(&self) -> Option<TransportError> {
        self.lost_error.borrow().clone()
    }

    /// The transport seen in `connection_made`, until `connection_lost`.
    pub fn transport(&self) -> Option<SerialTransport> {
        self.transport.borrow().clone()
    }
}

impl Protocol for RecordingProtocol {
    fn connection_made(&self, transport: &SerialTransport) {
        *self.transport.borrow_mut() = Some(transport.clone());
        self.events.borrow_mut().push(Event::Made);
    }

    fn data_received(&self, data: &[u8]) {
        self.events.borrow_mut().push(Event::Data(data.to_vec()));
        if self.close_on_newline.get() && data.contains(&b'\n') {
            if let Some(transport) = self.transport() {
                transport.close();
            }
        }
    }

    fn pause_writing(&self) -> Result<(), ProtocolError> {
        self.events.borrow_mut().push(Event::Pause);
        if self.fail_pause.get() {
            return Err("pause refused".into());
        }
        Ok(())
    }

    fn resume_writing(&self) -> Result<(), ProtocolError> {
        self.events.borrow_mut().push(Event::Resume);
        if self.fail_resume.get() {
            return Err("resume refused".into());
        }
        Ok(())
    }

    fn connection_lost(&self, error: Option<TransportError>) {
        self.events
            .borrow_mut()
            .push(Event::Lost(error.as_ref().map(|e| e.to_string())));
        *self.lost_error.borrow_mut() = error;
        self.transport.borrow_mut().take();
        if self.panic_on_lost.get() {
            panic!("connection_lost blew up");
        }
    }
}

/// A transport over a `MockDevice`, driven by a `ManualLoop`.
pub struct Harness {
    pub lp: Rc<ManualLoop>,
    pub device: MockDevice,
    pub protocol: Rc<RecordingProtocol>,
    pub transport: SerialTransport,
}

impl Harness {
    /// Readiness-driven transport, not yet started.
    pub fn new() -> Self {
        Self::build(ManualLoop::new(), MockDevice::new("MOCK0"), &TransportConfig::default())
    }

    /// Timer-polled transport, not yet started.
    pub fn polling() -> Self {
        Self::build(ManualLoop::polling(), MockDevice::new("MOCK0"), &TransportConfig::default())
    }

    pub fn with_config(config: &TransportConfig) -> Self {
        Self::build(ManualLoop::new(), MockDevice::new("MOCK0"), config)
    }

    pub fn build(lp: ManualLoop, device: MockDevice, config: &TransportConfig) -> Self {
        let lp = Rc::new(lp);
        let protocol = RecordingProtocol::new();
        let transport =
            SerialTransport::with_config(lp.clone(), protocol.clone(), Box::new(device.clone()), config)
                .expect("transport construction");
        Self {
            lp,
            device,
            protocol,
            transport,
        }
    }

    /// Run the queued construction callbacks.
    pub fn started(self) -> Self {
        self.lp.run_until_idle();
        self
    }

    /// Deliver a readable event and drain the loop.
    pub fn readable(&self) -> bool {
        let fired = self.lp.fire_readable(HANDLE);
        self.lp.run_until_idle();
        fired
    }

    /// Deliver a writable event and drain the loop.
    pub fn writable(&self) -> bool {
        let fired = self.lp.fire_writable(HANDLE);
        self.lp.run_until_idle();
        fired
    }

    pub fn exception_messages(&self) -> Vec<String> {
        self.lp
            .take_exceptions()
            .into_iter()
            .map(|context| context.message)
            .collect()
    }
}
