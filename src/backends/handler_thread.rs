// SPDX-License-Identifier: GPL-3.0-only

//! Named worker thread executing posted jobs in order
//!
//! Jobs travel through a [`BufferQueue`]. When the thread quits, jobs that
//! never ran are abandoned instead of silently dropped, so a job that owns
//! a listener can still report a failure.

use crate::concurrency::{BufferQueue, Disposable, lock_recover};
use crate::errors::DeviceError;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// Unit of work for a [`HandlerThread`]
pub trait Job: Send {
    /// Execute the job on the handler thread
    fn run(self: Box<Self>);

    /// The job will never run; release whatever it holds
    fn abandon(self: Box<Self>) {}
}

/// Job built from two closures
struct FnJob<R, A> {
    run: R,
    abandon: A,
}

impl<R, A> Job for FnJob<R, A>
where
    R: FnOnce() + Send,
    A: FnOnce() + Send,
{
    fn run(self: Box<Self>) {
        (self.run)();
    }

    fn abandon(self: Box<Self>) {
        (self.abandon)();
    }
}

/// Build a job that runs `run`, or `abandon` if it is discarded
pub fn job<R, A>(run: R, abandon: A) -> Box<dyn Job>
where
    R: FnOnce() + Send + 'static,
    A: FnOnce() + Send + 'static,
{
    Box::new(FnJob { run, abandon })
}

/// Worker thread with a job queue
///
/// # Example
///
/// ```
/// use camera_lifecycle::backends::HandlerThread;
/// use std::sync::mpsc;
///
/// let handler = HandlerThread::start("example").unwrap();
/// let (tx, rx) = mpsc::channel();
/// handler.post_fn(move || tx.send(7).unwrap());
/// assert_eq!(rx.recv().unwrap(), 7);
/// handler.quit();
/// ```
pub struct HandlerThread {
    name: String,
    queue: Arc<BufferQueue<Box<dyn Job>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl HandlerThread {
    /// Spawn the worker thread
    pub fn start(name: &str) -> Result<Self, DeviceError> {
        let queue: Arc<BufferQueue<Box<dyn Job>>> =
            Arc::new(BufferQueue::with_unused_handler(|job: Box<dyn Job>| job.abandon()));
        let worker_queue = Arc::clone(&queue);
        let name_clone = name.to_string();

        info!(name = %name, "Starting handler thread");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Handler thread started");
                while let Ok(job) = worker_queue.pop() {
                    job.run();
                }
                info!(name = %name_clone, "Handler thread exiting");
            })
            .map_err(|e| DeviceError::Unavailable(format!("failed to spawn {}: {}", name, e)))?;

        let thread_id = thread_handle.thread().id();
        Ok(Self {
            name: name.to_string(),
            queue,
            thread_handle: Mutex::new(Some(thread_handle)),
            thread_id,
        })
    }

    /// Thread name, for logging
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. After [`quit`](Self::quit) the job is abandoned
    /// immediately.
    pub fn post(&self, job: Box<dyn Job>) {
        self.queue.push(job);
    }

    /// Queue a closure that needs no cleanup when abandoned
    pub fn post_fn<F>(&self, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(job(run, || {}));
    }

    /// Number of jobs waiting to run
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether the calling thread is this handler's worker
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        lock_recover(&self.thread_handle)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting jobs, abandon the pending ones, and wait for the
    /// worker to finish its current job.
    ///
    /// Called from the worker itself, the thread is left to exit on its own.
    pub fn quit(&self) {
        self.queue.close();

        let Some(handle) = lock_recover(&self.thread_handle).take() else {
            return;
        };

        if self.is_current() {
            debug!(name = %self.name, "Handler thread quitting itself, detaching");
            return;
        }

        debug!(name = %self.name, "Waiting for handler thread to finish");
        if let Err(e) = handle.join() {
            warn!(name = %self.name, "Handler thread panicked: {:?}", e);
        }
    }
}

impl Disposable for HandlerThread {
    fn dispose(&self) {
        self.quit();
    }
}

impl Drop for HandlerThread {
    fn drop(&mut self) {
        self.quit();
    }
}

impl std::fmt::Debug for HandlerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerThread")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}
