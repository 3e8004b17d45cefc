//! Shared I/O executor.
//!
//! One executor drives the socket work of every publisher and subscriber
//! built on top of it. Worker threads run an async I/O loop; the loop is
//! kept alive by the held runtime until [`Executor::stop`] releases it.

use std::future::Future;
use std::sync::Mutex;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, warn};

/// Name given to executor worker threads. Best-effort; platforms that
/// cannot name threads simply ignore it.
const WORKER_THREAD_NAME: &str = "wirebus-io";

/// Shared async I/O executor backing publishers and subscribers.
///
/// Construct once, [`start`](Executor::start) it with a worker thread count,
/// and pass it (via `Arc`) to every [`Publisher`](crate::Publisher) and
/// [`Subscriber`](crate::Subscriber). All socket I/O, timers, and user
/// callbacks run on the executor's worker threads.
pub struct Executor {
    state: Mutex<State>,
}

struct State {
    runtime: Option<Runtime>,
    handle: Option<Handle>,
}

impl Executor {
    /// Create a stopped executor. Call [`start`](Executor::start) before
    /// constructing publishers or subscribers on it.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                runtime: None,
                handle: None,
            }),
        }
    }

    /// Spawn `thread_count` worker threads and start the I/O loop.
    ///
    /// A zero count is bumped to one. Calling `start` on a running executor
    /// is a no-op.
    pub fn start(&self, thread_count: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.runtime.is_some() {
            warn!("Executor already started");
            return;
        }

        let thread_count = thread_count.max(1);
        debug!(threads = thread_count, "Starting executor");

        match Builder::new_multi_thread()
            .worker_threads(thread_count)
            .thread_name(WORKER_THREAD_NAME)
            .enable_io()
            .enable_time()
            .build()
        {
            Ok(runtime) => {
                state.handle = Some(runtime.handle().clone());
                state.runtime = Some(runtime);
            }
            Err(e) => {
                warn!(error = %e, "Failed to start executor runtime");
            }
        }
    }

    /// Release the I/O loop and let the worker threads wind down.
    ///
    /// Tasks still running observe cancellation by way of their sockets
    /// being closed; cancel publishers and subscribers first for an orderly
    /// shutdown. Idempotent.
    pub fn stop(&self) {
        let runtime = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.handle = None;
            state.runtime.take()
        };
        if let Some(runtime) = runtime {
            debug!("Stopping executor");
            runtime.shutdown_background();
        }
    }

    /// Whether the executor has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .runtime
            .is_some()
    }

    /// Run a task on one of the worker threads.
    ///
    /// Tasks posted to a stopped executor are dropped with a warning.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.handle() {
            Some(handle) => {
                handle.spawn(task);
            }
            None => warn!("Task posted to a stopped executor, dropping it"),
        }
    }

    /// Handle onto the running I/O loop, if any.
    pub(crate) fn handle(&self) -> Option<Handle> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle
            .clone()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}
