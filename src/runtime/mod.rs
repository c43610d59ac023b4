//! Event loop capability set.
//!
//! The transport never talks to a reactor directly. It schedules callbacks,
//! registers readiness interest, offloads blocking device work and reports
//! unhandled errors through the [`EventLoop`] trait, which keeps all of its
//! state on one thread.
//!
//! Two loops ship with the crate:
//!
//! - [`ManualLoop`]: deterministic, virtual clock, readiness fired by hand.
//! - [`TokioEventLoop`]: runs inside a tokio `LocalSet`.

pub mod manual;
pub mod tokio_loop;

pub use manual::ManualLoop;
pub use tokio_loop::TokioEventLoop;

use crate::device::RawHandle;
use crate::error::TransportError;
use crate::transport::{Protocol, SerialTransport};
use std::cell::Cell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::error;

/// One-shot callback run on the loop thread.
pub type Callback = Box<dyn FnOnce()>;

/// Callback invoked each time a registered handle becomes ready.
pub type ReadyCallback = Rc<dyn Fn()>;

/// Work that may block, run on a background thread.
pub type BlockingJob = Box<dyn FnOnce() + Send>;

/// Future driven on the loop thread.
pub type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

/// Scheduling, readiness and diagnostics primitives of a single-threaded loop.
pub trait EventLoop {
    /// Run `callback` on a later iteration, in FIFO order with other
    /// `call_soon` callbacks.
    fn call_soon(&self, callback: Callback);

    /// Run `callback` after `delay` unless the returned handle is cancelled.
    fn call_later(&self, delay: Duration, callback: Callback) -> TimerHandle;

    /// Drive `task` to completion on the loop thread.
    fn spawn_local(&self, task: LocalTask);

    /// Run `job` on a background thread.
    ///
    /// The job must not touch loop state; hand results back through a
    /// channel, as [`run_blocking`] does.
    fn run_in_executor(&self, job: BlockingJob);

    /// Whether `add_reader`/`add_writer` are available.
    ///
    /// When false, transports fall back to timed polling.
    fn supports_readiness(&self) -> bool;

    /// Invoke `callback` whenever `handle` is readable. Replaces any
    /// previous reader for the handle.
    fn add_reader(&self, handle: RawHandle, callback: ReadyCallback) -> io::Result<()>;

    /// Stop watching `handle` for readability. Returns whether a reader was
    /// registered.
    fn remove_reader(&self, handle: RawHandle) -> bool;

    /// Invoke `callback` whenever `handle` is writable.
    fn add_writer(&self, handle: RawHandle, callback: ReadyCallback) -> io::Result<()>;

    /// Stop watching `handle` for writability.
    fn remove_writer(&self, handle: RawHandle) -> bool;

    /// Report an error nobody is positioned to handle.
    fn call_exception_handler(&self, context: ExceptionContext) {
        default_exception_handler(&context);
    }
}

/// Cancellation handle for [`EventLoop::call_later`].
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the callback from running. Has no effect once it has run.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Structured record handed to [`EventLoop::call_exception_handler`].
#[derive(Clone)]
pub struct ExceptionContext {
    pub message: String,
    pub error: Option<TransportError>,
    pub transport: Option<SerialTransport>,
    pub protocol: Option<Rc<dyn Protocol>>,
}

impl ExceptionContext {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: None,
            transport: None,
            protocol: None,
        }
    }

    pub fn with_error(mut self, error: TransportError) -> Self {
        self.error = Some(error);
        self
    }
}

impl std::fmt::Debug for ExceptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionContext")
            .field("message", &self.message)
            .field("error", &self.error)
            .field("transport", &self.transport.as_ref().map(|t| t.to_string()))
            .field("has_protocol", &self.protocol.is_some())
            .finish()
    }
}

/// Log an exception context through `tracing`.
pub fn default_exception_handler(context: &ExceptionContext) {
    let transport = context
        .transport
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_default();
    match &context.error {
        Some(e) => error!(transport = %transport, error = %e, "{}", context.message),
        None => error!(transport = %transport, "{}", context.message),
    }
}

/// Run `job` through the loop's executor and await its result on the loop
/// thread.
pub async fn run_blocking<T, F>(event_loop: &dyn EventLoop, job: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    event_loop.run_in_executor(Box::new(move || {
        // The receiver may be gone if the awaiting task was dropped.
        let _ = tx.send(job());
    }));
    rx.await.map_err(|_| TransportError::BackgroundTaskLost)
}
