// SPDX-License-Identifier: GPL-3.0-only

//! Thin request/open/close adapter over a [`SingleDeviceStateMachine`]

use super::actions::{DeviceActions, ShutdownListener};
use super::request::DeviceRequest;
use super::state_machine::{DeviceState, SingleDeviceStateMachine};
use crate::concurrency::{FutureResult, Lifetime, lock_recover};
use std::fmt::Display;
use std::sync::{Arc, Mutex};

/// Type-erased control surface of a lifecycle.
///
/// Lets the arbiter open and close lifecycles of different device types
/// through one handle.
pub trait LifecycleControl: Send + Sync {
    /// Ask the device to open
    fn open(&self);
    /// Close the latest request and ask the device to close
    fn close(&self);
    /// Whether the underlying state machine has shut down
    fn is_shutdown(&self) -> bool;
    /// Physical state of the underlying device
    fn device_state(&self) -> DeviceState;
}

/// Lifecycle of one device key
pub struct DeviceLifecycle<D, K> {
    key: K,
    machine: Arc<SingleDeviceStateMachine<D, K>>,
    last_request: Mutex<Option<Arc<DeviceRequest<D>>>>,
}

impl<D, K> DeviceLifecycle<D, K>
where
    D: Clone + Send + 'static,
    K: Clone + Display + Send + Sync + 'static,
{
    /// Build a lifecycle and its state machine
    pub fn new(
        key: K,
        actions: Arc<dyn DeviceActions<D>>,
        shutdown_listener: Arc<dyn ShutdownListener<K>>,
    ) -> Self {
        let machine = SingleDeviceStateMachine::new(actions, key.clone(), shutdown_listener);
        Self {
            key,
            machine,
            last_request: Mutex::new(None),
        }
    }

    /// Key of the device
    pub fn id(&self) -> &K {
        &self.key
    }

    /// The state machine driving this lifecycle
    pub fn state_machine(&self) -> &Arc<SingleDeviceStateMachine<D, K>> {
        &self.machine
    }

    /// Create a request scoped to `caller_lifetime` and make it current.
    ///
    /// Any earlier request is superseded and its future cancelled.
    pub fn create_request(&self, caller_lifetime: &Lifetime) -> FutureResult<D> {
        let request = DeviceRequest::new(caller_lifetime);
        let future = request.future();
        self.submit_request(request);
        future
    }

    /// Make an already created request current
    pub fn submit_request(&self, request: Arc<DeviceRequest<D>>) {
        *lock_recover(&self.last_request) = Some(Arc::clone(&request));
        self.machine.set_request(request);
    }

    /// Ask the device to open
    pub fn open(&self) {
        self.machine.request_open();
    }

    /// Close the latest request, then ask the device to close
    pub fn close(&self) {
        let last = lock_recover(&self.last_request).take();
        if let Some(request) = last {
            request.close();
        }
        self.machine.request_close();
    }
}

impl<D, K> LifecycleControl for DeviceLifecycle<D, K>
where
    D: Clone + Send + 'static,
    K: Clone + Display + Send + Sync + 'static,
{
    fn open(&self) {
        DeviceLifecycle::open(self);
    }

    fn close(&self) {
        DeviceLifecycle::close(self);
    }

    fn is_shutdown(&self) -> bool {
        self.machine.is_shutdown()
    }

    fn device_state(&self) -> DeviceState {
        self.machine.device_state()
    }
}

impl<D, K: Display> std::fmt::Debug for DeviceLifecycle<D, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLifecycle")
            .field("key", &self.key.to_string())
            .field("machine", &self.machine)
            .finish()
    }
}
