// SPDX-License-Identifier: GPL-3.0-only

//! Simulated camera backend
//!
//! Stands in for real hardware: opening and closing take a configurable
//! amount of time and individual cameras can be configured to fail. The
//! "hardware" work runs on one background thread shared by every device
//! action, and open results are delivered on a per-session callback thread
//! owned by the state machine's device lifetime.
//!
//! [`DeviceStats`] counts how many simulated cameras are open at once, which
//! is how the CLI and the tests check that only one device is ever open.

use super::handler_thread::{HandlerThread, job};
use crate::concurrency::{Disposable, Lifetime, RefCounted};
use crate::config::SimulationConfig;
use crate::constants::simulation;
use crate::device::{
    CameraId, CloseListener, DeviceActionProvider, DeviceActions, DeviceKey, OpenListener,
};
use crate::errors::{DeviceError, LifecycleResult};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to an open simulated camera
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedCamera {
    key: DeviceKey,
    session: Uuid,
    opened_at: DateTime<Local>,
}

impl SimulatedCamera {
    /// Key the camera was opened with
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Unique id of this open session
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// When the open completed
    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }
}

impl std::fmt::Display for SimulatedCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (session {})", self.key, self.session)
    }
}

/// Counters shared by every device of one provider
#[derive(Debug, Default)]
pub struct DeviceStats {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl DeviceStats {
    fn opened(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) {
        let _ = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    /// Devices open right now
    pub fn open_now(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Highest number of devices ever open at the same time
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    /// Total successful opens
    pub fn total_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Total completed closes, successful or not
    pub fn total_closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Device action provider backed by simulated hardware
pub struct SimulatedCameraProvider {
    config: SimulationConfig,
    executor: Arc<RefCounted<HandlerThread>>,
    stats: Arc<DeviceStats>,
}

impl SimulatedCameraProvider {
    /// Start the shared background executor
    pub fn new(config: SimulationConfig) -> LifecycleResult<Self> {
        let executor = HandlerThread::start(simulation::BACKGROUND_THREAD_NAME)?;
        Ok(Self {
            config,
            executor: Arc::new(RefCounted::new(executor)),
            stats: Arc::new(DeviceStats::default()),
        })
    }

    /// Cameras exposed by this backend
    pub fn cameras(&self) -> Vec<CameraId> {
        (0..self.config.camera_count)
            .map(CameraId::from_legacy)
            .collect()
    }

    /// Open/close counters
    pub fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }
}

impl DeviceActionProvider<SimulatedCamera> for SimulatedCameraProvider {
    fn actions_for(
        &self,
        key: &DeviceKey,
    ) -> LifecycleResult<Arc<dyn DeviceActions<SimulatedCamera>>> {
        self.executor.add_ref()?;
        Ok(Arc::new(SimulatedActions {
            key: key.clone(),
            config: self.config.clone(),
            executor: Arc::clone(&self.executor),
            stats: Arc::clone(&self.stats),
        }))
    }
}

impl Drop for SimulatedCameraProvider {
    fn drop(&mut self) {
        self.executor.dispose();
    }
}

impl std::fmt::Debug for SimulatedCameraProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCameraProvider")
            .field("cameras", &self.config.camera_count)
            .field("executor_refs", &self.executor.ref_count())
            .finish()
    }
}

/// Actions for one key; holds a reference on the shared executor
struct SimulatedActions {
    key: DeviceKey,
    config: SimulationConfig,
    executor: Arc<RefCounted<HandlerThread>>,
    stats: Arc<DeviceStats>,
}

impl SimulatedActions {
    fn configured(list: &[String], camera: &CameraId) -> bool {
        list.iter().any(|id| id == camera.value())
    }
}

impl DeviceActions<SimulatedCamera> for SimulatedActions {
    fn execute_open(
        &self,
        listener: OpenListener<SimulatedCamera>,
        device_lifetime: &Lifetime,
    ) -> Result<(), DeviceError> {
        let camera = self.key.camera_id();
        let session = device_lifetime.add(Arc::new(HandlerThread::start(&format!(
            "{}-{}",
            simulation::SESSION_THREAD_PREFIX,
            camera
        ))?));

        let fails = Self::configured(&self.config.failing_cameras, camera);
        let interrupted = Self::configured(&self.config.interrupted_cameras, camera);
        let latency = self.config.open_latency();
        let key = self.key.clone();
        let stats = Arc::clone(&self.stats);
        let on_abandon = listener.clone();

        debug!(key = %key, "Simulating open");
        self.executor.get().post(job(
            move || {
                thread::sleep(latency);
                if fails {
                    warn!(key = %key, "Simulated open failure");
                    let on_abandon = listener.clone();
                    session.post(job(
                        move || {
                            listener.failed(DeviceError::ErrorCode(simulation::OPEN_ERROR_CODE));
                        },
                        move || {
                            on_abandon.failed(DeviceError::Disconnected);
                        },
                    ));
                    return;
                }

                let device = SimulatedCamera {
                    key,
                    session: Uuid::new_v4(),
                    opened_at: Local::now(),
                };
                stats.opened();

                let on_abandon = listener.clone();
                let closing = device.clone();
                let abandon_stats = Arc::clone(&stats);
                session.post(job(
                    move || {
                        if interrupted {
                            listener.opened_but_should_close(device);
                        } else {
                            listener.opened(device);
                        }
                    },
                    move || {
                        // The session ended before the callback ran; the
                        // device never reached its owner.
                        debug!(key = %closing.key, "Open callback abandoned");
                        abandon_stats.closed();
                        on_abandon.failed(DeviceError::Disconnected);
                    },
                ));
            },
            move || {
                on_abandon.failed(DeviceError::Unavailable(
                    "camera executor stopped".to_string(),
                ));
            },
        ));
        Ok(())
    }

    fn execute_close(
        &self,
        listener: CloseListener,
        device: SimulatedCamera,
    ) -> Result<(), DeviceError> {
        let fails = Self::configured(&self.config.close_failing_cameras, device.key.camera_id());
        let latency = self.config.close_latency();
        let stats = Arc::clone(&self.stats);
        let abandon_stats = Arc::clone(&self.stats);
        let on_abandon = listener.clone();

        debug!(device = %device, "Simulating close");
        self.executor.get().post(job(
            move || {
                thread::sleep(latency);
                stats.closed();
                if fails {
                    warn!(device = %device, "Simulated close failure");
                    listener.failed(DeviceError::CloseFailed(format!(
                        "{} did not release",
                        device.key
                    )));
                } else {
                    listener.closed();
                }
            },
            move || {
                abandon_stats.closed();
                on_abandon.failed(DeviceError::CloseFailed(
                    "camera executor stopped".to_string(),
                ));
            },
        ));
        Ok(())
    }
}

impl Drop for SimulatedActions {
    fn drop(&mut self) {
        self.executor.dispose();
    }
}
