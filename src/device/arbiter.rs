// SPDX-License-Identifier: GPL-3.0-only

//! Arbitration between competing device requests
//!
//! The arbiter keeps at most one device open across the whole process:
//!
//! ```text
//!   open_device(A)          open_device(B)                A shut down
//!   ┌──────────────┐        ┌──────────────────┐         ┌───────────────┐
//!   │ current = A  │ ─────▶ │ current = A (→✕) │ ──────▶ │ current = B   │
//!   │ target  = -  │        │ target  = B      │         │ target  = -   │
//!   └──────────────┘        └──────────────────┘         └───────────────┘
//!        A.open()              A.close()                     B.open()
//! ```
//!
//! Decisions are made under the arbiter mutex. The lifecycle calls they
//! produce are queued and drained in order by whichever thread holds the
//! drain flag, with the mutex released. A lifecycle that shuts down
//! synchronously inside `close()` can therefore report back to the arbiter
//! without deadlocking, and calls reach the lifecycles in decision order.

use super::actions::DeviceActionProvider;
use super::lifecycle::{DeviceLifecycle, LifecycleControl};
use super::request::DeviceRequest;
use super::state_machine::DeviceState;
use super::tracker::ActiveDeviceTracker;
use super::{CameraId, DeviceKey};
use crate::concurrency::{FutureResult, Lifetime, lock_recover};
use crate::errors::LifecycleError;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};

/// A lifecycle owned by the arbiter.
///
/// `instance` tells apart two lifecycles created for the same key, so a
/// late shutdown report from a replaced lifecycle is not mistaken for the
/// current one.
#[derive(Clone)]
struct ManagedDevice {
    instance: u64,
    key: DeviceKey,
    control: Arc<dyn LifecycleControl>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Work decided under the lock, run in order after releasing it
enum Command {
    Submit(Box<dyn FnOnce() + Send>),
    Open(Arc<dyn LifecycleControl>),
    Close(Arc<dyn LifecycleControl>),
    TrackOpening(CameraId),
    TrackClosed(CameraId),
    /// Drops the arbiter's handle outside the lock, since the last
    /// reference to a lifecycle releases backend resources
    Release(ManagedDevice),
    CompleteShutdown(FutureResult<()>),
}

#[derive(Default)]
struct ArbiterState {
    current: Option<ManagedDevice>,
    target: Option<ManagedDevice>,
    pending_shutdown: Option<FutureResult<()>>,
    commands: VecDeque<Command>,
    draining: bool,
}

struct ArbiterInner {
    tracker: Arc<dyn ActiveDeviceTracker>,
    state: Mutex<ArbiterState>,
    next_instance: AtomicU64,
}

/// Process-wide coordinator enforcing a single open device.
///
/// Cloning yields another handle to the same arbiter. The application
/// builds one at startup and hands clones to whoever opens cameras.
#[derive(Clone)]
pub struct MultiDeviceArbiter {
    inner: Arc<ArbiterInner>,
}

impl MultiDeviceArbiter {
    /// Create an arbiter reporting to `tracker`
    pub fn new(tracker: Arc<dyn ActiveDeviceTracker>) -> Self {
        debug!("Creating the multi device arbiter");
        Self {
            inner: Arc::new(ArbiterInner {
                tracker,
                state: Mutex::new(ArbiterState::default()),
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    /// Open `key` through `provider`.
    ///
    /// The returned future resolves with the device once it is open, fails
    /// if the backend reports an error, and is cancelled if the request is
    /// superseded or `caller_lifetime` is disposed first. Disposing
    /// `caller_lifetime` after the device opened releases it.
    ///
    /// Never blocks on the backend.
    pub fn open_device<D>(
        &self,
        caller_lifetime: &Lifetime,
        key: DeviceKey,
        provider: &dyn DeviceActionProvider<D>,
    ) -> FutureResult<D>
    where
        D: Clone + Send + 'static,
    {
        debug!(key = %key, "Open device requested");
        let request = DeviceRequest::new(caller_lifetime);
        let future = request.future();
        let actions = provider.actions_for(&key);

        let mut state = lock_recover(&self.inner.state);
        Self::cancel_shutdown(&mut state);

        let reusable = state
            .current
            .as_ref()
            .filter(|current| current.key == key && !current.control.is_shutdown())
            .cloned();

        if let Some(current) = reusable {
            debug!(key = %key, "Reusing the current device");
            let Ok(lifecycle) = Arc::clone(&current.typed).downcast::<DeviceLifecycle<D, DeviceKey>>()
            else {
                drop(state);
                request.close_with_error(LifecycleError::DeviceTypeMismatch(key));
                return future;
            };
            Self::clear_target(&mut state);
            state
                .commands
                .push_back(Command::Submit(Box::new(move || lifecycle.submit_request(request))));
            state.commands.push_back(Command::Open(current.control));
            state
                .commands
                .push_back(Command::TrackOpening(key.camera_id().clone()));
            self.drain(state);
            return future;
        }

        let actions = match actions {
            Ok(actions) => actions,
            Err(error) => {
                drop(state);
                info!(key = %key, error = %error, "Device backend unavailable");
                request.close_with_error(error);
                return future;
            }
        };

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let listener = move |shut_down: &DeviceKey| {
            if let Some(inner) = Weak::upgrade(&weak) {
                MultiDeviceArbiter { inner }.on_device_shutdown(shut_down, instance);
            }
        };
        let lifecycle = Arc::new(DeviceLifecycle::new(key.clone(), actions, Arc::new(listener)));
        let device = ManagedDevice {
            instance,
            key: key.clone(),
            control: lifecycle.clone(),
            typed: lifecycle.clone(),
        };
        let submit = Command::Submit(Box::new(move || lifecycle.submit_request(request)));

        match state.current.clone() {
            Some(current) if current.key != key => {
                debug!(key = %key, current = %current.key, "Queueing device behind the current one");
                Self::clear_target(&mut state);
                state.target = Some(device);
                state.commands.push_back(submit);
                state.commands.push_back(Command::Close(current.control));
            }
            _ => {
                // Either nothing is current, or the current lifecycle for
                // this key already shut down and its report is still in flight.
                debug!(key = %key, "Creating a new current device");
                Self::clear_target(&mut state);
                let control = Arc::clone(&device.control);
                if let Some(stale) = state.current.replace(device) {
                    state.commands.push_back(Command::Release(stale));
                }
                state.commands.push_back(submit);
                state.commands.push_back(Command::Open(control));
                state
                    .commands
                    .push_back(Command::TrackOpening(key.camera_id().clone()));
            }
        }

        self.drain(state);
        future
    }

    /// Close every open or queued device.
    ///
    /// The future resolves once the current device has fully shut down, or
    /// immediately when nothing is open. Calling again while a shutdown is
    /// pending returns the same future. A later `open_device` cancels it.
    ///
    /// The tracker receives `on_camera_closed` for the shut down camera
    /// before the future resolves.
    pub fn shutdown(&self) -> FutureResult<()> {
        let mut state = lock_recover(&self.inner.state);
        debug!("Shutdown requested");

        if let Some(pending) = state.pending_shutdown.as_ref() {
            if !pending.is_done() {
                return pending.clone();
            }
            state.pending_shutdown = None;
        }

        let Some(current) = state.current.clone() else {
            return FutureResult::immediate(());
        };

        Self::clear_target(&mut state);
        let pending = FutureResult::new();
        state.pending_shutdown = Some(pending.clone());
        state.commands.push_back(Command::Close(current.control));
        self.drain(state);
        pending
    }

    /// Key of the current device, if any
    pub fn current_key(&self) -> Option<DeviceKey> {
        lock_recover(&self.inner.state)
            .current
            .as_ref()
            .map(|current| current.key.clone())
    }

    /// Key of the device queued behind the current one, if any
    pub fn target_key(&self) -> Option<DeviceKey> {
        lock_recover(&self.inner.state)
            .target
            .as_ref()
            .map(|target| target.key.clone())
    }

    /// Physical state of the current device, if any
    pub fn current_state(&self) -> Option<DeviceState> {
        let control = lock_recover(&self.inner.state)
            .current
            .as_ref()
            .map(|current| Arc::clone(&current.control));
        control.map(|control| control.device_state())
    }

    fn on_device_shutdown(&self, key: &DeviceKey, instance: u64) {
        let mut state = lock_recover(&self.inner.state);
        debug!(key = %key, "Device shut down");

        let is_current = state
            .current
            .as_ref()
            .is_some_and(|current| current.instance == instance);

        if is_current || state.current.is_none() {
            if let Some(pending) = state.pending_shutdown.take() {
                info!("Completing shutdown");
                if let Some(released) = state.current.take() {
                    state.commands.push_back(Command::Release(released));
                }
                if is_current {
                    state
                        .commands
                        .push_back(Command::TrackClosed(key.camera_id().clone()));
                }
                state.commands.push_back(Command::CompleteShutdown(pending));
                self.drain(state);
                return;
            }
        }

        if is_current {
            match state.target.take() {
                Some(target) => {
                    debug!(key = %target.key, "Opening the queued device");
                    let control = Arc::clone(&target.control);
                    let camera = target.key.camera_id().clone();
                    if let Some(released) = state.current.replace(target) {
                        state.commands.push_back(Command::Release(released));
                    }
                    state.commands.push_back(Command::Open(control));
                    state.commands.push_back(Command::TrackOpening(camera));
                }
                None => {
                    debug!(key = %key, "No queued device, clearing the current one");
                    if let Some(released) = state.current.take() {
                        state.commands.push_back(Command::Release(released));
                    }
                    state
                        .commands
                        .push_back(Command::TrackClosed(key.camera_id().clone()));
                }
            }
        }

        self.drain(state);
    }

    fn cancel_shutdown(state: &mut ArbiterState) {
        if let Some(pending) = state.pending_shutdown.take() {
            info!("Cancelling shutdown");
            pending.set_cancelled();
        }
    }

    fn clear_target(state: &mut ArbiterState) {
        if let Some(target) = state.target.take() {
            debug!(key = %target.key, "Dropping the queued device");
            state.commands.push_back(Command::Close(target.control));
        }
    }

    /// Run queued commands unless another frame on this or another thread
    /// is already doing so
    fn drain<'a>(&'a self, mut state: MutexGuard<'a, ArbiterState>) {
        if state.draining {
            return;
        }
        state.draining = true;

        loop {
            let Some(command) = state.commands.pop_front() else {
                state.draining = false;
                return;
            };
            drop(state);
            self.execute(command);
            state = lock_recover(&self.inner.state);
        }
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Submit(submit) => submit(),
            Command::Open(control) => control.open(),
            Command::Close(control) => control.close(),
            Command::TrackOpening(camera) => self.inner.tracker.on_camera_opening(&camera),
            Command::TrackClosed(camera) => self.inner.tracker.on_camera_closed(&camera),
            Command::Release(device) => drop(device),
            Command::CompleteShutdown(pending) => {
                pending.set_value(());
            }
        }
    }
}

impl std::fmt::Debug for MultiDeviceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_recover(&self.inner.state);
        f.debug_struct("MultiDeviceArbiter")
            .field("current", &state.current.as_ref().map(|d| d.key.to_string()))
            .field("target", &state.target.as_ref().map(|d| d.key.to_string()))
            .field("shutdown_pending", &state.pending_shutdown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::actions::{CloseListener, DeviceActions, OpenListener};
    use crate::device::tracker::{ActiveCameraDeviceTracker, TrackerEventKind};
    use crate::device::ApiType;
    use crate::errors::{DeviceError, LifecycleResult};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Open(String),
        Close(String),
    }

    /// Records calls and parks listeners until the test fires them
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<Call>>,
        opens: Mutex<Vec<(String, OpenListener<String>)>>,
        closes: Mutex<Vec<(String, CloseListener)>>,
        device_lifetimes: Mutex<Vec<Lifetime>>,
    }

    struct ScriptedActions {
        key: String,
        script: Arc<Scripted>,
    }

    impl DeviceActions<String> for ScriptedActions {
        fn execute_open(
            &self,
            listener: OpenListener<String>,
            device_lifetime: &Lifetime,
        ) -> Result<(), DeviceError> {
            self.script.calls.lock().unwrap().push(Call::Open(self.key.clone()));
            self.script.opens.lock().unwrap().push((self.key.clone(), listener));
            self.script
                .device_lifetimes
                .lock()
                .unwrap()
                .push(device_lifetime.clone());
            Ok(())
        }

        fn execute_close(&self, listener: CloseListener, device: String) -> Result<(), DeviceError> {
            self.script.calls.lock().unwrap().push(Call::Close(device.clone()));
            self.script.closes.lock().unwrap().push((device, listener));
            Ok(())
        }
    }

    struct ScriptedProvider(Arc<Scripted>);

    impl DeviceActionProvider<String> for ScriptedProvider {
        fn actions_for(&self, key: &DeviceKey) -> LifecycleResult<Arc<dyn DeviceActions<String>>> {
            Ok(Arc::new(ScriptedActions {
                key: key.camera_id().to_string(),
                script: Arc::clone(&self.0),
            }))
        }
    }

    impl Scripted {
        fn fire_opened(&self) {
            let (key, listener) = self.opens.lock().unwrap().remove(0);
            listener.opened(format!("device-{}", key));
        }

        fn fire_closed(&self) {
            let (_, listener) = self.closes.lock().unwrap().remove(0);
            listener.closed();
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn key(id: &str) -> DeviceKey {
        DeviceKey::new(ApiType::Camera2, CameraId::new(id))
    }

    fn setup() -> (MultiDeviceArbiter, ActiveCameraDeviceTracker, Arc<Scripted>, ScriptedProvider) {
        let tracker = ActiveCameraDeviceTracker::new();
        let arbiter = MultiDeviceArbiter::new(Arc::new(tracker.clone()));
        let script = Arc::new(Scripted::default());
        let provider = ScriptedProvider(Arc::clone(&script));
        (arbiter, tracker, script, provider)
    }

    #[test]
    fn test_switch_device_sequencing() {
        let (arbiter, tracker, script, provider) = setup();
        let caller = Lifetime::new();

        let future_a = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();
        assert_eq!(future_a.get(), Ok("device-a".to_string()));

        let future_b = arbiter.open_device(&caller, key("b"), &provider);
        assert_eq!(script.calls(), vec![Call::Open("a".into()), Call::Close("device-a".into())]);
        assert_eq!(arbiter.target_key(), Some(key("b")));
        assert!(!future_b.is_done());

        script.fire_closed();
        assert_eq!(
            script.calls(),
            vec![
                Call::Open("a".into()),
                Call::Close("device-a".into()),
                Call::Open("b".into()),
            ]
        );
        script.fire_opened();
        assert_eq!(future_b.get(), Ok("device-b".to_string()));
        assert_eq!(arbiter.current_key(), Some(key("b")));

        let kinds: Vec<_> = tracker
            .events()
            .into_iter()
            .map(|event| (event.kind, event.camera.to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (TrackerEventKind::Opening, "a".to_string()),
                (TrackerEventKind::Opening, "b".to_string()),
            ]
        );
    }

    #[test]
    fn test_same_key_reuses_device() {
        let (arbiter, _, script, provider) = setup();
        let caller = Lifetime::new();

        let first = arbiter.open_device(&caller, key("a"), &provider);
        let second = arbiter.open_device(&caller, key("a"), &provider);
        assert!(first.is_cancelled());

        script.fire_opened();
        assert_eq!(second.get(), Ok("device-a".to_string()));
        assert_eq!(script.calls(), vec![Call::Open("a".into())]);

        let third = arbiter.open_device(&caller, key("a"), &provider);
        assert_eq!(third.try_get(), Some("device-a".to_string()));
    }

    #[test]
    fn test_shutdown_with_nothing_open_resolves() {
        let (arbiter, _, _, _) = setup();
        assert_eq!(arbiter.shutdown().get(), Ok(()));
        assert_eq!(arbiter.shutdown().get(), Ok(()));
    }

    #[test]
    fn test_shutdown_converges() {
        let (arbiter, tracker, script, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();

        let first = arbiter.shutdown();
        let again = arbiter.shutdown();
        assert!(!first.is_done());

        script.fire_closed();
        assert_eq!(first.get(), Ok(()));
        assert_eq!(again.get(), Ok(()));
        assert_eq!(arbiter.current_key(), None);
        assert_eq!(tracker.active_camera(), None);

        assert_eq!(arbiter.shutdown().get(), Ok(()));
    }

    #[test]
    fn test_open_cancels_pending_shutdown() {
        let (arbiter, _, script, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();

        let shutdown = arbiter.shutdown();
        let reopened = arbiter.open_device(&caller, key("b"), &provider);
        assert!(shutdown.is_cancelled());

        script.fire_closed();
        script.fire_opened();
        assert_eq!(reopened.get(), Ok("device-b".to_string()));
    }

    #[test]
    fn test_open_failure_reaches_only_the_future() {
        let (arbiter, tracker, script, provider) = setup();
        let caller = Lifetime::new();
        let future = arbiter.open_device(&caller, key("a"), &provider);

        let (_, listener) = script.opens.lock().unwrap().remove(0);
        listener.failed(DeviceError::ErrorCode(2));

        assert_eq!(
            future.get(),
            Err(LifecycleError::Device(DeviceError::ErrorCode(2)))
        );
        assert_eq!(arbiter.current_key(), None);
        assert_eq!(tracker.active_or_previous_camera(), Some(CameraId::new("a")));

        // The arbiter is usable again afterwards.
        let retry = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();
        assert_eq!(retry.get(), Ok("device-a".to_string()));
    }

    #[test]
    fn test_device_type_mismatch() {
        struct Numbers;
        impl DeviceActions<u32> for Numbers {
            fn execute_open(&self, _: OpenListener<u32>, _: &Lifetime) -> Result<(), DeviceError> {
                Ok(())
            }
            fn execute_close(&self, listener: CloseListener, _: u32) -> Result<(), DeviceError> {
                listener.closed();
                Ok(())
            }
        }
        struct NumberProvider;
        impl DeviceActionProvider<u32> for NumberProvider {
            fn actions_for(&self, _: &DeviceKey) -> LifecycleResult<Arc<dyn DeviceActions<u32>>> {
                Ok(Arc::new(Numbers))
            }
        }

        let (arbiter, _, _, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        let mismatched = arbiter.open_device(&caller, key("a"), &NumberProvider);

        assert_eq!(
            mismatched.get(),
            Err(LifecycleError::DeviceTypeMismatch(key("a")))
        );
    }

    #[test]
    fn test_reopen_while_switching_reuses_machine() {
        let (arbiter, _, script, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();

        let future_b = arbiter.open_device(&caller, key("b"), &provider);
        let future_a = arbiter.open_device(&caller, key("a"), &provider);
        assert!(future_b.is_cancelled());
        assert_eq!(arbiter.target_key(), None);
        assert_eq!(arbiter.current_state(), Some(DeviceState::Closing));

        // The close completes and the same machine opens again
        script.fire_closed();
        assert_eq!(
            script.calls(),
            vec![
                Call::Open("a".into()),
                Call::Close("device-a".into()),
                Call::Open("a".into()),
            ]
        );
        script.fire_opened();
        assert_eq!(future_a.get(), Ok("device-a".to_string()));
        assert_eq!(arbiter.current_key(), Some(key("a")));
        assert_eq!(arbiter.current_state(), Some(DeviceState::Opened));
    }

    #[test]
    fn test_newer_target_replaces_queued_one() {
        let (arbiter, _, script, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();

        let future_b = arbiter.open_device(&caller, key("b"), &provider);
        let future_c = arbiter.open_device(&caller, key("c"), &provider);
        assert!(future_b.is_cancelled());
        assert_eq!(arbiter.target_key(), Some(key("c")));
        assert_eq!(arbiter.current_key(), Some(key("a")));
        assert_eq!(
            script.calls(),
            vec![Call::Open("a".into()), Call::Close("device-a".into())]
        );

        script.fire_closed();
        assert_eq!(arbiter.current_key(), Some(key("c")));
        assert_eq!(arbiter.target_key(), None);
        script.fire_opened();
        assert_eq!(future_c.get(), Ok("device-c".to_string()));
        assert!(!script.calls().contains(&Call::Open("b".into())));
    }

    #[test]
    fn test_shutdown_drops_queued_target() {
        let (arbiter, _, script, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();

        let future_b = arbiter.open_device(&caller, key("b"), &provider);
        let shutdown = arbiter.shutdown();
        assert!(future_b.is_cancelled());
        assert_eq!(arbiter.target_key(), None);
        assert!(!shutdown.is_done());

        script.fire_closed();
        assert_eq!(shutdown.get(), Ok(()));
        assert_eq!(arbiter.current_key(), None);
        assert_eq!(
            script.calls(),
            vec![Call::Open("a".into()), Call::Close("device-a".into())]
        );
    }

    #[test]
    fn test_reopen_before_shutdown_report_drops_target() {
        let (arbiter, _, script, provider) = setup();
        let caller = Lifetime::new();
        let _ = arbiter.open_device(&caller, key("a"), &provider);
        script.fire_opened();

        // Reopen "a" from inside its own teardown, after the machine shut
        // down but before the arbiter hears about it.
        let reopened = Arc::new(Mutex::new(None));
        {
            let arbiter = arbiter.clone();
            let script = Arc::clone(&script);
            let caller = caller.clone();
            let reopened = Arc::clone(&reopened);
            let device_lifetime = script.device_lifetimes.lock().unwrap()[0].clone();
            device_lifetime.add_fn(move || {
                let provider = ScriptedProvider(script);
                let future = arbiter.open_device(&caller, key("a"), &provider);
                *reopened.lock().unwrap() = Some(future);
            });
        }

        let future_b = arbiter.open_device(&caller, key("b"), &provider);
        script.fire_closed();

        assert!(future_b.is_cancelled());
        assert_eq!(arbiter.target_key(), None);
        assert_eq!(arbiter.current_key(), Some(key("a")));
        assert_eq!(
            script.calls(),
            vec![
                Call::Open("a".into()),
                Call::Close("device-a".into()),
                Call::Open("a".into()),
            ]
        );

        script.fire_opened();
        let future_a = reopened.lock().unwrap().take().unwrap();
        assert_eq!(future_a.get(), Ok("device-a".to_string()));
    }
}
