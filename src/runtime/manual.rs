//! Deterministic event loop.
//!
//! `ManualLoop` runs nothing on its own. Callers drain it with
//! [`ManualLoop::run_until_idle`], move its virtual clock with
//! [`ManualLoop::advance`], and deliver readiness with
//! [`ManualLoop::fire_readable`] / [`ManualLoop::fire_writable`]. Blocking
//! jobs are queued and run inline while draining, so every interleaving is
//! reproducible.

use super::{
    BlockingJob, Callback, EventLoop, ExceptionContext, LocalTask, ReadyCallback, TimerHandle,
};
use crate::device::RawHandle;
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;
use tracing::{error, trace};

struct Timer {
    deadline: Duration,
    seq: u64,
    handle: TimerHandle,
    callback: Callback,
}

/// Hand-driven single-threaded loop.
pub struct ManualLoop {
    ready: RefCell<VecDeque<Callback>>,
    timers: RefCell<Vec<Timer>>,
    jobs: RefCell<VecDeque<BlockingJob>>,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    readers: RefCell<HashMap<RawHandle, ReadyCallback>>,
    writers: RefCell<HashMap<RawHandle, ReadyCallback>>,
    exceptions: RefCell<Vec<ExceptionContext>>,
    now: Cell<Duration>,
    seq: Cell<u64>,
    readiness: bool,
}

impl ManualLoop {
    /// A loop that supports readiness registration.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A loop without readiness support, so transports poll on timers.
    pub fn polling() -> Self {
        Self::build(false)
    }

    fn build(readiness: bool) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Vec::new()),
            jobs: RefCell::new(VecDeque::new()),
            pool: RefCell::new(pool),
            spawner,
            readers: RefCell::new(HashMap::new()),
            writers: RefCell::new(HashMap::new()),
            exceptions: RefCell::new(Vec::new()),
            now: Cell::new(Duration::ZERO),
            seq: Cell::new(0),
            readiness,
        }
    }

    /// Run ready callbacks, tasks and queued blocking jobs until none is left.
    ///
    /// Timers are not fired; see [`ManualLoop::advance`].
    pub fn run_until_idle(&self) {
        loop {
            while let Some(callback) = self.pop_ready() {
                callback();
            }
            self.pool.borrow_mut().run_until_stalled();

            let job = self.jobs.borrow_mut().pop_front();
            match job {
                Some(job) => job(),
                None if self.ready.borrow().is_empty() => break,
                None => {}
            }
        }
    }

    fn pop_ready(&self) -> Option<Callback> {
        self.ready.borrow_mut().pop_front()
    }

    /// Move the virtual clock forward by `by`, firing due timers in order and
    /// draining the loop after each one.
    pub fn advance(&self, by: Duration) {
        let target = self.now.get() + by;
        self.run_until_idle();
        while let Some(timer) = self.pop_due_timer(target) {
            self.now.set(timer.deadline);
            if !timer.handle.is_cancelled() {
                (timer.callback)();
            }
            self.run_until_idle();
        }
        self.now.set(target);
    }

    fn pop_due_timer(&self, target: Duration) -> Option<Timer> {
        let mut timers = self.timers.borrow_mut();
        let index = timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline <= target)
            .min_by_key(|(_, t)| (t.deadline, t.seq))
            .map(|(i, _)| i)?;
        Some(timers.swap_remove(index))
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Invoke the reader registered for `handle`. Returns false if none is.
    pub fn fire_readable(&self, handle: RawHandle) -> bool {
        let callback = self.readers.borrow().get(&handle).cloned();
        callback.map(|cb| cb()).is_some()
    }

    /// Invoke the writer registered for `handle`. Returns false if none is.
    pub fn fire_writable(&self, handle: RawHandle) -> bool {
        let callback = self.writers.borrow().get(&handle).cloned();
        callback.map(|cb| cb()).is_some()
    }

    pub fn has_reader(&self, handle: RawHandle) -> bool {
        self.readers.borrow().contains_key(&handle)
    }

    pub fn has_writer(&self, handle: RawHandle) -> bool {
        self.writers.borrow().contains_key(&handle)
    }

    /// Number of timers that have not fired yet, cancelled ones included.
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Remove and return everything reported to the exception handler.
    pub fn take_exceptions(&self) -> Vec<ExceptionContext> {
        std::mem::take(&mut *self.exceptions.borrow_mut())
    }
}

impl Default for ManualLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for ManualLoop {
    fn call_soon(&self, callback: Callback) {
        self.ready.borrow_mut().push_back(callback);
    }

    fn call_later(&self, delay: Duration, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.timers.borrow_mut().push(Timer {
            deadline: self.now.get() + delay,
            seq,
            handle: handle.clone(),
            callback,
        });
        handle
    }

    fn spawn_local(&self, task: LocalTask) {
        if let Err(e) = self.spawner.spawn_local(task) {
            error!("ManualLoop could not spawn task: {}", e);
        }
    }

    fn run_in_executor(&self, job: BlockingJob) {
        self.jobs.borrow_mut().push_back(job);
    }

    fn supports_readiness(&self) -> bool {
        self.readiness
    }

    fn add_reader(&self, handle: RawHandle, callback: ReadyCallback) -> io::Result<()> {
        if !self.readiness {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "readiness not supported"));
        }
        trace!(handle, "add_reader");
        self.readers.borrow_mut().insert(handle, callback);
        Ok(())
    }

    fn remove_reader(&self, handle: RawHandle) -> bool {
        self.readers.borrow_mut().remove(&handle).is_some()
    }

    fn add_writer(&self, handle: RawHandle, callback: ReadyCallback) -> io::Result<()> {
        if !self.readiness {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "readiness not supported"));
        }
        trace!(handle, "add_writer");
        self.writers.borrow_mut().insert(handle, callback);
        Ok(())
    }

    fn remove_writer(&self, handle: RawHandle) -> bool {
        self.writers.borrow_mut().remove(&handle).is_some()
    }

    fn call_exception_handler(&self, context: ExceptionContext) {
        super::default_exception_handler(&context);
        self.exceptions.borrow_mut().push(context);
    }
}
