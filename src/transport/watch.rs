//! Reader/writer watching strategies.
//!
//! A transport picks one strategy when it is built: readiness callbacks when
//! the loop supports them and the device exposes a handle, timed polling
//! otherwise. The transport itself never branches on the platform.

use super::{SerialTransport, WeakTransport};
use crate::device::RawHandle;
use crate::runtime::{EventLoop, TimerHandle};
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Keeps track of whether the transport is watching for input and output.
pub(crate) trait Watcher {
    /// Start calling `read_ready` on the transport. No-op if already started.
    fn start_reading(&self, event_loop: &Rc<dyn EventLoop>, transport: WeakTransport) -> io::Result<()>;

    fn stop_reading(&self, event_loop: &dyn EventLoop);

    fn is_reading(&self) -> bool;

    /// Start calling `write_ready` on the transport. No-op if already started.
    fn start_writing(&self, event_loop: &Rc<dyn EventLoop>, transport: WeakTransport) -> io::Result<()>;

    fn stop_writing(&self, event_loop: &dyn EventLoop);

    fn is_writing(&self) -> bool;

    fn kind(&self) -> &'static str;
}

/// Registers the device handle with the loop's readiness notification.
pub(crate) struct ReadinessWatcher {
    handle: RawHandle,
    reading: Cell<bool>,
    writing: Cell<bool>,
}

impl ReadinessWatcher {
    pub(crate) fn new(handle: RawHandle) -> Self {
        Self {
            handle,
            reading: Cell::new(false),
            writing: Cell::new(false),
        }
    }
}

impl Watcher for ReadinessWatcher {
    fn start_reading(&self, event_loop: &Rc<dyn EventLoop>, transport: WeakTransport) -> io::Result<()> {
        if self.reading.get() {
            return Ok(());
        }
        event_loop.add_reader(
            self.handle,
            Rc::new(move || {
                if let Some(t) = transport.upgrade() {
                    t.read_ready();
                }
            }),
        )?;
        self.reading.set(true);
        Ok(())
    }

    fn stop_reading(&self, event_loop: &dyn EventLoop) {
        if self.reading.replace(false) {
            event_loop.remove_reader(self.handle);
        }
    }

    fn is_reading(&self) -> bool {
        self.reading.get()
    }

    fn start_writing(&self, event_loop: &Rc<dyn EventLoop>, transport: WeakTransport) -> io::Result<()> {
        if self.writing.get() {
            return Ok(());
        }
        event_loop.add_writer(
            self.handle,
            Rc::new(move || {
                if let Some(t) = transport.upgrade() {
                    t.write_ready();
                }
            }),
        )?;
        self.writing.set(true);
        Ok(())
    }

    fn stop_writing(&self, event_loop: &dyn EventLoop) {
        if self.writing.replace(false) {
            event_loop.remove_writer(self.handle);
        }
    }

    fn is_writing(&self) -> bool {
        self.writing.get()
    }

    fn kind(&self) -> &'static str {
        "readiness"
    }
}

type PollAction = Rc<dyn Fn(&SerialTransport)>;

/// A self re-arming timer. The slot holds the handle of the next tick while
/// the timer runs.
#[derive(Clone)]
struct PollTimer {
    slot: Rc<RefCell<Option<TimerHandle>>>,
    interval: Duration,
}

impl PollTimer {
    fn new(interval: Duration) -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
            interval,
        }
    }

    fn start(&self, event_loop: &Rc<dyn EventLoop>, first: Duration, transport: WeakTransport, action: PollAction) {
        if self.is_active() {
            return;
        }
        self.schedule(event_loop, first, transport, action);
    }

    fn schedule(&self, event_loop: &Rc<dyn EventLoop>, delay: Duration, transport: WeakTransport, action: PollAction) {
        let timer = self.clone();
        let weak_loop: Weak<dyn EventLoop> = Rc::downgrade(event_loop);
        let handle = event_loop.call_later(
            delay,
            Box::new(move || timer.tick(weak_loop, transport, action)),
        );
        *self.slot.borrow_mut() = Some(handle);
    }

    fn tick(&self, weak_loop: Weak<dyn EventLoop>, transport: WeakTransport, action: PollAction) {
        let (Some(event_loop), Some(t)) = (weak_loop.upgrade(), transport.upgrade()) else {
            self.slot.borrow_mut().take();
            return;
        };
        // Re-arm first so the action can stop the timer.
        self.schedule(&event_loop, self.interval, transport, action.clone());
        action(&t);
    }

    fn stop(&self) {
        if let Some(handle) = self.slot.borrow_mut().take() {
            handle.cancel();
        }
    }

    fn is_active(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

/// Checks the device's queue counters on a short timer.
pub(crate) struct PollingWatcher {
    reader: PollTimer,
    writer: PollTimer,
    max_out_waiting: usize,
}

impl PollingWatcher {
    pub(crate) fn new(interval: Duration, max_out_waiting: usize) -> Self {
        Self {
            reader: PollTimer::new(interval),
            writer: PollTimer::new(interval),
            max_out_waiting,
        }
    }
}

impl Watcher for PollingWatcher {
    fn start_reading(&self, event_loop: &Rc<dyn EventLoop>, transport: WeakTransport) -> io::Result<()> {
        self.reader.start(
            event_loop,
            self.reader.interval,
            transport,
            Rc::new(|t: &SerialTransport| t.poll_read()),
        );
        Ok(())
    }

    fn stop_reading(&self, _event_loop: &dyn EventLoop) {
        self.reader.stop();
    }

    fn is_reading(&self) -> bool {
        self.reader.is_active()
    }

    fn start_writing(&self, event_loop: &Rc<dyn EventLoop>, transport: WeakTransport) -> io::Result<()> {
        let max_out_waiting = self.max_out_waiting;
        self.writer.start(
            event_loop,
            Duration::ZERO,
            transport,
            Rc::new(move |t: &SerialTransport| t.poll_write(max_out_waiting)),
        );
        Ok(())
    }

    fn stop_writing(&self, _event_loop: &dyn EventLoop) {
        self.writer.stop();
    }

    fn is_writing(&self) -> bool {
        self.writer.is_active()
    }

    fn kind(&self) -> &'static str {
        "polling"
    }
}
