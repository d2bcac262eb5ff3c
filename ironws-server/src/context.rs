//! Single-threaded execution context.
//!
//! An [`ExecutionContext`] owns a `current_thread` tokio runtime and the
//! dedicated worker thread that drives it. Every accept, read and write
//! task runs on that one thread, so application callbacks never run
//! concurrently with each other.
//!
//! Components that schedule work hold a [`ContextHandle`], which does not
//! keep the worker alive. The context itself is never cloned.

use crate::error::LifecycleError;
use parking_lot::Mutex;
use std::future::Future;
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "ironws-io";

enum ContextState {
    Idle(Runtime),
    Running(JoinHandle<()>),
    Stopped,
}

/// Owns the run-loop and its worker thread.
pub struct ExecutionContext {
    handle: ContextHandle,
    state: Mutex<ContextState>,
}

impl ExecutionContext {
    /// Creates an idle context. Nothing runs until [`run`](Self::run).
    ///
    /// # Errors
    /// Returns [`LifecycleError::Runtime`] if the runtime cannot be built.
    pub fn new() -> Result<Self, LifecycleError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LifecycleError::Runtime)?;

        let handle = ContextHandle {
            runtime: runtime.handle().clone(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        Ok(Self {
            handle,
            state: Mutex::new(ContextState::Idle(runtime)),
        })
    }

    /// Returns a non-owning handle for scheduling work on this context.
    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Starts the worker thread and returns immediately.
    ///
    /// Work spawned before `run` is queued and starts once the worker is up.
    /// The worker keeps running until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    /// Returns [`LifecycleError::AlreadyRunning`] if the worker is running,
    /// [`LifecycleError::Stopped`] after a stop, or
    /// [`LifecycleError::Runtime`] if the thread cannot be spawned.
    pub fn run(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        let runtime = match std::mem::replace(&mut *state, ContextState::Stopped) {
            ContextState::Idle(runtime) => runtime,
            running @ ContextState::Running(_) => {
                *state = running;
                return Err(LifecycleError::AlreadyRunning);
            }
            ContextState::Stopped => return Err(LifecycleError::Stopped),
        };

        let shutdown = self.handle.shutdown.clone();
        let tracker = self.handle.tracker.clone();
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    shutdown.cancelled().await;
                    tracker.close();
                    tracker.wait().await;
                });
                tracing::debug!("execution context drained");
            })
            .map_err(LifecycleError::Runtime)?;

        *state = ContextState::Running(worker);
        tracing::debug!("execution context running");
        Ok(())
    }

    /// Signals shutdown and joins the worker thread.
    ///
    /// Every tracked task observes the shutdown token; the worker exits once
    /// all of them have finished. Stopping an idle context discards queued
    /// work. Stopping twice is a no-op.
    ///
    /// # Errors
    /// Returns [`LifecycleError::JoinFromWorker`] when called on the worker
    /// thread itself. Shutdown is still signalled in that case; the worker
    /// drains and exits on its own, and a later `stop` from another thread
    /// joins it. Returns [`LifecycleError::WorkerPanicked`] if the worker
    /// panicked.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.handle.shutdown.cancel();

        let previous = {
            let mut state = self.state.lock();
            if let ContextState::Running(worker) = &*state
                && worker.thread().id() == thread::current().id()
            {
                return Err(LifecycleError::JoinFromWorker);
            }
            std::mem::replace(&mut *state, ContextState::Stopped)
        };

        match previous {
            ContextState::Running(worker) => {
                worker.join().map_err(|_| LifecycleError::WorkerPanicked)?;
                tracing::debug!("execution context stopped");
            }
            ContextState::Idle(runtime) => runtime.shutdown_background(),
            ContextState::Stopped => {}
        }
        Ok(())
    }

    /// Returns true while the worker thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ContextState::Running(_))
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "execution context did not stop cleanly");
        }
    }
}

/// Non-owning handle to an [`ExecutionContext`].
#[derive(Clone)]
pub struct ContextHandle {
    runtime: Handle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ContextHandle {
    /// Spawns a tracked task on the context.
    ///
    /// The context's worker does not exit until the task completes, so the
    /// task must observe [`shutdown_token`](Self::shutdown_token).
    ///
    /// # Errors
    /// Returns [`LifecycleError::Stopped`] once shutdown has been signalled.
    pub fn spawn<F>(&self, task: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(LifecycleError::Stopped);
        }
        self.tracker.spawn_on(task, &self.runtime);
        Ok(())
    }

    /// Returns the token cancelled when the context shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns true once shutdown has been signalled.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
