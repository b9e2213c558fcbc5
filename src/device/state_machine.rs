// SPDX-License-Identifier: GPL-3.0-only

//! State machine mediating between the state a caller wants a device in
//! and the state the hardware reports
//!
//! There are four device states and two target states:
//!
//! ```text
//! Device    Target
//! Opening   Opened  -> nothing, wait for the open callback
//! Opened    Opened  -> resolve the pending request with the device
//! Closing   Opened  -> nothing, wait for the close callback
//! Closed    Opened  -> execute open, device moves to Opening
//! Opening   Closed  -> nothing, wait for the open callback
//! Opened    Closed  -> execute close, device moves to Closing
//! Closing   Closed  -> nothing, wait for the close callback
//! Closed    Closed  -> shut down
//! ```
//!
//! Every transition runs under one mutex. Calls into the backend, request
//! closing, and the shutdown listener are collected as effects and run
//! after the mutex is released, so backends may call back synchronously.

use super::actions::{
    CloseListener, CloseResult, DeviceActions, DeviceListener, OpenListener, OpenResult,
    ShutdownListener,
};
use super::request::DeviceRequest;
use crate::concurrency::{Lifetime, lock_recover};
use crate::errors::{DeviceError, LifecycleError};
use std::fmt::Display;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Physical state of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// An open call is in flight
    Opening,
    /// The device is open
    Opened,
    /// A close call is in flight
    Closing,
    /// The device is closed
    Closed,
}

/// State the machine should reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// The device should be open
    Opened,
    /// The device should be closed
    Closed,
}

struct MachineState<D> {
    is_shutdown: bool,
    device_state: DeviceState,
    target_state: TargetState,
    request: Option<Arc<DeviceRequest<D>>>,
    open_device: Option<D>,
}

/// Work decided under the lock and performed after releasing it
enum Effect<D> {
    Open,
    Close(D),
    CloseRequest(Arc<DeviceRequest<D>>),
    NotifyShutdown,
}

/// Per-device lifecycle state machine.
///
/// Once shut down (after a full close, or after any open/close failure) the
/// machine is permanently inert; a new machine is needed to open the device
/// again.
pub struct SingleDeviceStateMachine<D, K> {
    key: K,
    actions: Arc<dyn DeviceActions<D>>,
    shutdown_listener: Arc<dyn ShutdownListener<K>>,
    device_lifetime: Lifetime,
    state: Mutex<MachineState<D>>,
    this: Weak<Self>,
}

impl<D, K> SingleDeviceStateMachine<D, K>
where
    D: Clone + Send + 'static,
    K: Clone + Display + Send + Sync + 'static,
{
    /// Create a machine with both device and target state closed
    pub fn new(
        actions: Arc<dyn DeviceActions<D>>,
        key: K,
        shutdown_listener: Arc<dyn ShutdownListener<K>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            actions,
            shutdown_listener,
            device_lifetime: Lifetime::new(),
            state: Mutex::new(MachineState {
                is_shutdown: false,
                device_state: DeviceState::Closed,
                target_state: TargetState::Closed,
                request: None,
                open_device: None,
            }),
            this: this.clone(),
        })
    }

    /// Key this machine was created for
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Current physical state
    pub fn device_state(&self) -> DeviceState {
        lock_recover(&self.state).device_state
    }

    /// Current target state
    pub fn target_state(&self) -> TargetState {
        lock_recover(&self.state).target_state
    }

    /// Whether the machine has shut down
    pub fn is_shutdown(&self) -> bool {
        lock_recover(&self.state).is_shutdown
    }

    /// Move towards an open device
    pub fn request_open(&self) {
        self.transition(|machine, state, effects| {
            state.target_state = TargetState::Opened;
            machine.update(state, effects);
        });
    }

    /// Move towards a closed device
    pub fn request_close(&self) {
        self.transition(|machine, state, effects| {
            state.target_state = TargetState::Closed;
            machine.update(state, effects);
        });
    }

    /// Make `request` the pending request.
    ///
    /// The previous request is closed, which cancels it if it never
    /// resolved. If the device is already open the new request resolves
    /// immediately. Abandoning the request (closing its lifetime) while it
    /// is still the current one asks the machine to close.
    pub fn set_request(&self, request: Arc<DeviceRequest<D>>) {
        let mut effects = Vec::new();
        {
            let mut state = lock_recover(&self.state);
            if state.is_shutdown {
                drop(state);
                debug!(key = %self.key, request = %request.id(), "Request on shut down device");
                request.close();
                return;
            }

            if let Some(device) = state.open_device.as_ref() {
                request.set(device.clone());
            }
            if let Some(previous) = state.request.replace(Arc::clone(&request)) {
                effects.push(Effect::CloseRequest(previous));
            }
        }

        self.device_lifetime.add(Arc::clone(&request));

        let machine = self.this.clone();
        let request_id = request.id();
        request.lifetime().add_fn(move || {
            if let Some(machine) = machine.upgrade() {
                machine.request_close_if_current(request_id);
            }
        });

        self.run(effects);
    }

    /// The device finished opening
    pub fn on_opened(&self, device: D) {
        self.transition(|machine, state, effects| {
            debug!(key = %machine.key, "Device opened");
            state.open_device = Some(device);
            state.device_state = DeviceState::Opened;
            machine.update(state, effects);
        });
    }

    /// The device could not be opened
    pub fn on_open_failed(&self, error: DeviceError) {
        self.transition(|machine, state, effects| {
            machine.fail_request(state, error.into(), effects);
            machine.shutdown_locked(state, effects);
        });
    }

    /// The device opened although a close was already requested.
    ///
    /// The pending request fails and the fresh device is closed right away
    /// through this same machine, so a later open request can still reuse
    /// it once the close completes.
    pub fn on_opened_but_should_close(&self, device: D) {
        self.transition(|machine, state, effects| {
            machine.fail_request(state, DeviceError::OpenInterrupted.into(), effects);
            machine.begin_close(state, Some(device), effects);
        });
    }

    /// The device finished closing
    pub fn on_closed(&self) {
        self.transition(|machine, state, effects| {
            debug!(key = %machine.key, "Device closed");
            state.open_device = None;
            state.device_state = DeviceState::Closed;
            machine.update(state, effects);
        });
    }

    /// The device could not be closed
    pub fn on_close_failed(&self, error: DeviceError) {
        self.transition(|machine, state, effects| {
            machine.fail_request(state, error.into(), effects);
            machine.shutdown_locked(state, effects);
        });
    }

    /// Cancel everything and reset to a clean, permanently inert state.
    ///
    /// The shutdown listener fires once, on the first call.
    pub fn shutdown(&self) {
        let mut effects = Vec::new();
        {
            let mut state = lock_recover(&self.state);
            self.shutdown_locked(&mut state, &mut effects);
        }
        self.run(effects);
    }

    /// Run one transition unless the machine is already shut down
    fn transition<F>(&self, apply: F)
    where
        F: FnOnce(&Self, &mut MachineState<D>, &mut Vec<Effect<D>>),
    {
        let mut effects = Vec::new();
        {
            let mut state = lock_recover(&self.state);
            if state.is_shutdown {
                return;
            }
            apply(self, &mut state, &mut effects);
        }
        self.run(effects);
    }

    fn update(&self, state: &mut MachineState<D>, effects: &mut Vec<Effect<D>>) {
        if state.is_shutdown {
            return;
        }

        match (state.device_state, state.target_state) {
            (DeviceState::Closed, TargetState::Opened) => {
                debug!(key = %self.key, "Executing open");
                state.device_state = DeviceState::Opening;
                effects.push(Effect::Open);
            }
            (DeviceState::Opened, TargetState::Opened) => {
                if let (Some(request), Some(device)) = (&state.request, &state.open_device) {
                    request.set(device.clone());
                }
            }
            (DeviceState::Opened, TargetState::Closed) => {
                let device = state.open_device.take();
                self.begin_close(state, device, effects);
            }
            (DeviceState::Closed, TargetState::Closed) => {
                self.shutdown_locked(state, effects);
            }
            (DeviceState::Opening, _) | (DeviceState::Closing, _) => {}
        }
    }

    fn begin_close(
        &self,
        state: &mut MachineState<D>,
        device: Option<D>,
        effects: &mut Vec<Effect<D>>,
    ) {
        match device {
            Some(device) => {
                debug!(key = %self.key, "Executing close");
                state.device_state = DeviceState::Closing;
                state.target_state = TargetState::Closed;
                if let Some(request) = state.request.take() {
                    effects.push(Effect::CloseRequest(request));
                }
                effects.push(Effect::Close(device));
            }
            None => self.shutdown_locked(state, effects),
        }
    }

    fn fail_request(
        &self,
        state: &mut MachineState<D>,
        error: LifecycleError,
        effects: &mut Vec<Effect<D>>,
    ) {
        state.open_device = None;
        if let Some(request) = state.request.take() {
            warn!(key = %self.key, request = %request.id(), error = %error, "Device request failed");
            request.set_exception(error);
            effects.push(Effect::CloseRequest(request));
        }
    }

    fn shutdown_locked(&self, state: &mut MachineState<D>, effects: &mut Vec<Effect<D>>) {
        if state.is_shutdown {
            warn!(key = %self.key, "Shutdown was called multiple times");
            return;
        }

        info!(key = %self.key, "Shutting down the device lifecycle");
        state.is_shutdown = true;
        state.open_device = None;
        state.device_state = DeviceState::Closed;
        state.target_state = TargetState::Closed;
        if let Some(request) = state.request.take() {
            effects.push(Effect::CloseRequest(request));
        }
        effects.push(Effect::NotifyShutdown);
    }

    fn request_close_if_current(&self, request_id: uuid::Uuid) {
        let is_current = {
            let state = lock_recover(&self.state);
            state
                .request
                .as_ref()
                .is_none_or(|request| request.id() == request_id)
        };
        if is_current {
            debug!(key = %self.key, request = %request_id, "Current request abandoned");
            self.request_close();
        }
    }

    fn run(&self, effects: Vec<Effect<D>>) {
        for effect in effects {
            match effect {
                Effect::Open => {
                    let listener = self.open_listener();
                    if let Err(error) = self
                        .actions
                        .execute_open(listener.clone(), &self.device_lifetime)
                    {
                        listener.failed(error);
                    }
                }
                Effect::Close(device) => {
                    let listener = self.close_listener();
                    if let Err(error) = self.actions.execute_close(listener.clone(), device) {
                        listener.failed(error);
                    }
                }
                Effect::CloseRequest(request) => request.close(),
                Effect::NotifyShutdown => {
                    self.device_lifetime.dispose();
                    self.shutdown_listener.on_shutdown(&self.key);
                }
            }
        }
    }

    fn open_listener(&self) -> OpenListener<D> {
        let machine = self.this.upgrade();
        DeviceListener::new(move |result| {
            let Some(machine) = machine else { return };
            match result {
                OpenResult::Opened(device) => machine.on_opened(device),
                OpenResult::Failed(error) => machine.on_open_failed(error),
                OpenResult::OpenedButShouldClose(device) => {
                    machine.on_opened_but_should_close(device)
                }
            }
        })
    }

    fn close_listener(&self) -> CloseListener {
        let machine = self.this.upgrade();
        DeviceListener::new(move |result| {
            let Some(machine) = machine else { return };
            match result {
                CloseResult::Closed => machine.on_closed(),
                CloseResult::Failed(error) => machine.on_close_failed(error),
            }
        })
    }
}

impl<D, K: Display> std::fmt::Debug for SingleDeviceStateMachine<D, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_recover(&self.state);
        f.debug_struct("SingleDeviceStateMachine")
            .field("key", &self.key.to_string())
            .field("device_state", &state.device_state)
            .field("target_state", &state.target_state)
            .field("is_shutdown", &state.is_shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Actions that park listeners so the test decides when callbacks fire
    #[derive(Default)]
    struct ParkedActions {
        opens: Mutex<Vec<OpenListener<u32>>>,
        closes: Mutex<Vec<(CloseListener, u32)>>,
    }

    impl DeviceActions<u32> for ParkedActions {
        fn execute_open(
            &self,
            listener: OpenListener<u32>,
            _device_lifetime: &Lifetime,
        ) -> Result<(), DeviceError> {
            self.opens.lock().unwrap().push(listener);
            Ok(())
        }

        fn execute_close(&self, listener: CloseListener, device: u32) -> Result<(), DeviceError> {
            self.closes.lock().unwrap().push((listener, device));
            Ok(())
        }
    }

    impl ParkedActions {
        fn take_open(&self) -> OpenListener<u32> {
            self.opens.lock().unwrap().remove(0)
        }

        fn take_close(&self) -> (CloseListener, u32) {
            self.closes.lock().unwrap().remove(0)
        }
    }

    fn machine() -> (
        Arc<SingleDeviceStateMachine<u32, String>>,
        Arc<ParkedActions>,
        Arc<AtomicUsize>,
    ) {
        let actions = Arc::new(ParkedActions::default());
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shutdowns);
        let listener = move |_key: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        let machine = SingleDeviceStateMachine::new(
            actions.clone() as Arc<dyn DeviceActions<u32>>,
            "cam0".to_string(),
            Arc::new(listener),
        );
        (machine, actions, shutdowns)
    }

    #[test]
    fn test_open_resolves_request() {
        let (machine, actions, _) = machine();
        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        let future = request.future();

        machine.set_request(request);
        machine.request_open();
        assert_eq!(machine.device_state(), DeviceState::Opening);

        assert!(actions.take_open().opened(42));
        assert_eq!(machine.device_state(), DeviceState::Opened);
        assert_eq!(future.get(), Ok(42));
    }

    #[test]
    fn test_close_then_shutdown() {
        let (machine, actions, shutdowns) = machine();
        machine.request_open();
        actions.take_open().opened(1);

        machine.request_close();
        assert_eq!(machine.device_state(), DeviceState::Closing);
        let (close, device) = actions.take_close();
        assert_eq!(device, 1);

        close.closed();
        assert!(machine.is_shutdown());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        // Inert after shutdown.
        machine.request_open();
        machine.shutdown();
        assert!(actions.opens.lock().unwrap().is_empty());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_fails_request_and_shuts_down() {
        let (machine, actions, shutdowns) = machine();
        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        let future = request.future();
        machine.set_request(request);
        machine.request_open();

        actions.take_open().failed(DeviceError::ErrorCode(5));

        assert_eq!(
            future.get(),
            Err(LifecycleError::Device(DeviceError::ErrorCode(5)))
        );
        assert!(machine.is_shutdown());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_synchronous_open_error_counts_as_failure() {
        struct Refusing;
        impl DeviceActions<u32> for Refusing {
            fn execute_open(&self, _: OpenListener<u32>, _: &Lifetime) -> Result<(), DeviceError> {
                Err(DeviceError::Unavailable("no hardware".into()))
            }
            fn execute_close(&self, _: CloseListener, _: u32) -> Result<(), DeviceError> {
                Ok(())
            }
        }

        let machine = SingleDeviceStateMachine::new(
            Arc::new(Refusing),
            "cam".to_string(),
            Arc::new(|_: &String| {}),
        );
        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        let future = request.future();
        machine.set_request(request);
        machine.request_open();

        assert!(matches!(
            future.get(),
            Err(LifecycleError::Device(DeviceError::Unavailable(_)))
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn test_opened_but_should_close_closes_and_can_reopen() {
        let (machine, actions, shutdowns) = machine();
        let caller = Lifetime::new();
        let first = DeviceRequest::new(&caller);
        let first_future = first.future();
        machine.set_request(first);
        machine.request_open();

        actions.take_open().opened_but_should_close(7);
        assert_eq!(
            first_future.get(),
            Err(LifecycleError::Device(DeviceError::OpenInterrupted))
        );
        assert_eq!(machine.device_state(), DeviceState::Closing);
        let (close, device) = actions.take_close();
        assert_eq!(device, 7);

        // A new request arrives while the interrupted device is closing.
        let second = DeviceRequest::new(&caller);
        let second_future = second.future();
        machine.set_request(second);
        machine.request_open();
        close.closed();

        assert!(!machine.is_shutdown());
        actions.take_open().opened(8);
        assert_eq!(second_future.get(), Ok(8));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_failure_shuts_down() {
        let (machine, actions, shutdowns) = machine();
        machine.request_open();
        actions.take_open().opened(3);
        machine.request_close();

        let (close, _) = actions.take_close();
        close.failed(DeviceError::CloseFailed("stuck".into()));

        assert!(machine.is_shutdown());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoning_current_request_closes_device() {
        let (machine, actions, _) = machine();
        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        machine.set_request(request);
        machine.request_open();
        actions.take_open().opened(11);

        caller.dispose();

        assert_eq!(machine.device_state(), DeviceState::Closing);
        assert_eq!(machine.target_state(), TargetState::Closed);
    }

    #[test]
    fn test_superseded_request_does_not_close_device() {
        let (machine, actions, _) = machine();
        let first_caller = Lifetime::new();
        let second_caller = Lifetime::new();

        let first = DeviceRequest::new(&first_caller);
        let first_future = first.future();
        machine.set_request(first);
        machine.request_open();

        let second = DeviceRequest::new(&second_caller);
        let second_future = second.future();
        machine.set_request(second);
        assert!(first_future.is_cancelled());

        first_caller.dispose();
        actions.take_open().opened(2);

        assert_eq!(machine.device_state(), DeviceState::Opened);
        assert_eq!(second_future.get(), Ok(2));
    }

    #[test]
    fn test_set_request_on_open_device_resolves_immediately() {
        let (machine, actions, _) = machine();
        machine.request_open();
        actions.take_open().opened(4);

        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        let future = request.future();
        machine.set_request(request);

        assert_eq!(future.try_get(), Some(4));
    }

    #[test]
    fn test_request_on_shut_down_machine_is_cancelled() {
        let (machine, _, _) = machine();
        machine.shutdown();

        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        let future = request.future();
        machine.set_request(request);

        assert!(future.is_cancelled());
    }

    #[test]
    fn test_close_before_open_shuts_down() {
        let (machine, actions, shutdowns) = machine();
        machine.request_close();

        assert!(machine.is_shutdown());
        assert!(actions.opens.lock().unwrap().is_empty());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
