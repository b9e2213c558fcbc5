// SPDX-License-Identifier: GPL-3.0-only

//! Seams between the lifecycle core and camera backends
//!
//! A backend implements [`DeviceActionProvider`] to hand out
//! [`DeviceActions`] per key. Each open or close call receives a fresh
//! one-shot listener and must eventually dispatch exactly one result on it.

use super::DeviceKey;
use crate::concurrency::{Lifetime, lock_recover};
use crate::errors::{DeviceError, LifecycleResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Outcome of an asynchronous open call
#[derive(Debug, Clone)]
pub enum OpenResult<D> {
    /// The device is open and ready
    Opened(D),
    /// The device could not be opened
    Failed(DeviceError),
    /// The device opened, but the backend saw it was already asked to close
    OpenedButShouldClose(D),
}

/// Outcome of an asynchronous close call
#[derive(Debug, Clone)]
pub enum CloseResult {
    /// The device is closed
    Closed,
    /// Closing failed; the device is assumed unusable
    Failed(DeviceError),
}

type Sink<R> = Box<dyn FnOnce(R) + Send>;

struct ListenerInner<R> {
    called: AtomicBool,
    sink: Mutex<Option<Sink<R>>>,
}

/// One-shot callback handed to a backend for a single open or close call.
///
/// Clones share the same guard, so backends can give a copy to each
/// hardware callback and let the first one win.
pub struct DeviceListener<R> {
    inner: Arc<ListenerInner<R>>,
}

/// Listener for [`DeviceActions::execute_open`]
pub type OpenListener<D> = DeviceListener<OpenResult<D>>;

/// Listener for [`DeviceActions::execute_close`]
pub type CloseListener = DeviceListener<CloseResult>;

impl<R> DeviceListener<R> {
    /// Create a listener that forwards the first dispatched result to `sink`
    pub fn new<F>(sink: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        Self {
            inner: Arc::new(ListenerInner {
                called: AtomicBool::new(false),
                sink: Mutex::new(Some(Box::new(sink))),
            }),
        }
    }

    /// Deliver a result.
    ///
    /// Returns `false` without doing anything if a result was already
    /// delivered through this listener or one of its clones.
    pub fn dispatch(&self, result: R) -> bool {
        if self.inner.called.swap(true, Ordering::SeqCst) {
            trace!("Listener was re-executed, ignoring");
            return false;
        }
        let sink = lock_recover(&self.inner.sink).take();
        match sink {
            Some(sink) => {
                sink(result);
                true
            }
            None => false,
        }
    }

    /// Whether a result has been delivered
    pub fn is_called(&self) -> bool {
        self.inner.called.load(Ordering::SeqCst)
    }
}

impl<R> Clone for DeviceListener<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> DeviceListener<OpenResult<D>> {
    /// Report a successful open
    pub fn opened(&self, device: D) -> bool {
        self.dispatch(OpenResult::Opened(device))
    }

    /// Report a failed open
    pub fn failed(&self, error: DeviceError) -> bool {
        self.dispatch(OpenResult::Failed(error))
    }

    /// Report a device that opened after a close was requested
    pub fn opened_but_should_close(&self, device: D) -> bool {
        self.dispatch(OpenResult::OpenedButShouldClose(device))
    }
}

impl DeviceListener<CloseResult> {
    /// Report a completed close
    pub fn closed(&self) -> bool {
        self.dispatch(CloseResult::Closed)
    }

    /// Report a failed close
    pub fn failed(&self, error: DeviceError) -> bool {
        self.dispatch(CloseResult::Failed(error))
    }
}

impl<R> std::fmt::Debug for DeviceListener<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceListener")
            .field("called", &self.is_called())
            .finish()
    }
}

/// Asynchronous open/close operations for one device key
pub trait DeviceActions<D>: Send + Sync {
    /// Start opening the device.
    ///
    /// Resources that must live exactly as long as the device session (for
    /// example a callback thread) should be registered with
    /// `device_lifetime`. Returning `Err` counts as a failed open.
    fn execute_open(
        &self,
        listener: OpenListener<D>,
        device_lifetime: &Lifetime,
    ) -> Result<(), DeviceError>;

    /// Start closing an open device. Returning `Err` counts as a failed close.
    fn execute_close(&self, listener: CloseListener, device: D) -> Result<(), DeviceError>;
}

/// Backend factory producing [`DeviceActions`] for a key
pub trait DeviceActionProvider<D>: Send + Sync {
    /// Actions for opening and closing `key`
    fn actions_for(&self, key: &DeviceKey) -> LifecycleResult<Arc<dyn DeviceActions<D>>>;
}

/// Notified once when a state machine has fully shut down
pub trait ShutdownListener<K>: Send + Sync {
    /// The machine for `key` is permanently inert
    fn on_shutdown(&self, key: &K);
}

impl<K, F> ShutdownListener<K> for F
where
    F: Fn(&K) + Send + Sync,
{
    fn on_shutdown(&self, key: &K) {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listener_dispatches_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let listener: OpenListener<u32> = DeviceListener::new(move |result| {
            if let OpenResult::Opened(value) = result {
                counter.fetch_add(value as usize, Ordering::SeqCst);
            }
        });
        let other = listener.clone();

        assert!(listener.opened(3));
        assert!(!other.failed(DeviceError::Disconnected));
        assert!(!listener.opened(10));
        assert!(other.is_called());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_close_listener_helpers() {
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let listener: CloseListener = DeviceListener::new(move |result| {
            *slot.lock().unwrap() = Some(matches!(result, CloseResult::Closed));
        });

        assert!(listener.closed());
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }
}
