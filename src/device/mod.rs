// SPDX-License-Identifier: GPL-3.0-only

//! Camera device lifecycle
//!
//! ```text
//!  caller ──open_device──▶ MultiDeviceArbiter ──▶ DeviceLifecycle ──▶ SingleDeviceStateMachine
//!    ▲                            │                                        │
//!    │                            ▼                                        ▼
//!    └──── FutureResult ◀── ActiveDeviceTracker            DeviceActions (backend)
//! ```
//!
//! The arbiter guarantees at most one device is opening or open at any
//! time. Each device key gets its own state machine, which drives the
//! backend's asynchronous open/close calls and resolves caller requests.

pub mod actions;
pub mod arbiter;
pub mod key;
pub mod lifecycle;
pub mod request;
pub mod state_machine;
pub mod tracker;

pub use actions::{
    CloseListener, CloseResult, DeviceActionProvider, DeviceActions, DeviceListener,
    OpenListener, OpenResult, ShutdownListener,
};
pub use arbiter::MultiDeviceArbiter;
pub use key::{ApiType, CameraId, DeviceKey};
pub use lifecycle::{DeviceLifecycle, LifecycleControl};
pub use request::DeviceRequest;
pub use state_machine::{DeviceState, SingleDeviceStateMachine, TargetState};
pub use tracker::{ActiveCameraDeviceTracker, ActiveDeviceTracker, TrackerEvent, TrackerEventKind};
