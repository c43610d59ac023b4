//! Event loop backed by a tokio `LocalSet`.
//!
//! Callbacks and tasks are spawned with `tokio::task::spawn_local`, so every
//! method must be called from inside a `LocalSet` (for example within
//! `LocalSet::run_until`). Blocking jobs go to `spawn_blocking`. On unix,
//! readiness comes from `AsyncFd`; elsewhere `supports_readiness` is false
//! and transports poll.

use super::{BlockingJob, Callback, EventLoop, LocalTask, ReadyCallback, TimerHandle};
use crate::device::RawHandle;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(unix)]
use std::rc::Weak;
#[cfg(unix)]
use tokio::io::unix::AsyncFd;
#[cfg(unix)]
use tracing::warn;

/// A live readiness watch; dropping the flag stops the callback even before
/// the aborted task is torn down.
struct Watch {
    active: Rc<Cell<bool>>,
    task: JoinHandle<()>,
}

impl Watch {
    fn stop(self) {
        self.active.set(false);
        self.task.abort();
    }
}

/// Event loop for use inside a tokio `LocalSet`.
#[derive(Default)]
pub struct TokioEventLoop {
    readers: RefCell<HashMap<RawHandle, Watch>>,
    writers: RefCell<HashMap<RawHandle, Watch>>,
    /// One registration per descriptor, shared by its reader and writer.
    #[cfg(unix)]
    registrations: RefCell<HashMap<RawHandle, Weak<AsyncFd<RawHandle>>>>,
}

impl TokioEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(unix)]
    fn registration(&self, handle: RawHandle) -> io::Result<Rc<AsyncFd<RawHandle>>> {
        if let Some(existing) = self.registrations.borrow().get(&handle).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let registration = Rc::new(AsyncFd::with_interest(
            handle,
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        )?);
        self.registrations
            .borrow_mut()
            .insert(handle, Rc::downgrade(&registration));
        Ok(registration)
    }

    #[cfg(unix)]
    fn watch(&self, handle: RawHandle, direction: Direction, callback: ReadyCallback) -> io::Result<Watch> {
        let registration = self.registration(handle)?;
        let active = Rc::new(Cell::new(true));
        let flag = active.clone();

        let task = tokio::task::spawn_local(async move {
            while flag.get() {
                let ready = match direction {
                    Direction::Read => registration.readable().await,
                    Direction::Write => registration.writable().await,
                };
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(handle, "readiness wait failed: {}", e);
                        break;
                    }
                };
                if !flag.get() {
                    break;
                }
                callback();
                // Edge-triggered: only forget readiness once the descriptor
                // has really been drained.
                if !direction.still_ready(handle) {
                    guard.clear_ready();
                }
                drop(guard);
                tokio::task::yield_now().await;
            }
        });

        Ok(Watch { active, task })
    }

    #[cfg(not(unix))]
    fn watch(&self, _handle: RawHandle, _direction: Direction, _callback: ReadyCallback) -> io::Result<Watch> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "readiness notification is not available on this platform",
        ))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    #[cfg(unix)]
    fn still_ready(self, handle: RawHandle) -> bool {
        let events = match self {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        };
        let mut pollfd = libc::pollfd {
            fd: handle,
            events,
            revents: 0,
        };
        // SAFETY: `pollfd` is a valid, exclusively borrowed array of length 1
        // and a zero timeout never blocks.
        let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
        rc > 0 && (pollfd.revents & events) != 0
    }
}

impl EventLoop for TokioEventLoop {
    fn call_soon(&self, callback: Callback) {
        tokio::task::spawn_local(async move { callback() });
    }

    fn call_later(&self, delay: Duration, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = handle.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if !timer.is_cancelled() {
                callback();
            }
        });
        handle
    }

    fn spawn_local(&self, task: LocalTask) {
        tokio::task::spawn_local(task);
    }

    fn run_in_executor(&self, job: BlockingJob) {
        tokio::task::spawn_blocking(job);
    }

    fn supports_readiness(&self) -> bool {
        cfg!(unix)
    }

    fn add_reader(&self, handle: RawHandle, callback: ReadyCallback) -> io::Result<()> {
        self.remove_reader(handle);
        let watch = self.watch(handle, Direction::Read, callback)?;
        self.readers.borrow_mut().insert(handle, watch);
        Ok(())
    }

    fn remove_reader(&self, handle: RawHandle) -> bool {
        let watch = self.readers.borrow_mut().remove(&handle);
        watch.map(Watch::stop).is_some()
    }

    fn add_writer(&self, handle: RawHandle, callback: ReadyCallback) -> io::Result<()> {
        self.remove_writer(handle);
        let watch = self.watch(handle, Direction::Write, callback)?;
        self.writers.borrow_mut().insert(handle, watch);
        Ok(())
    }

    fn remove_writer(&self, handle: RawHandle) -> bool {
        let watch = self.writers.borrow_mut().remove(&handle);
        watch.map(Watch::stop).is_some()
    }
}
