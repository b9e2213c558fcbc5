// SPDX-License-Identifier: GPL-3.0-only

//! Camera device lifecycle
//!
//! Guarantees that, across many concurrent requesters and an asynchronous,
//! failure-prone camera API, at most one physical camera is open at a time
//! and every request ends with either a device or a definitive error.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`concurrency`]: Lifetime, ref counting, blocking queue, settable future
//! - [`device`]: Device keys, per-device state machine, lifecycle, arbiter
//! - [`backends`]: Simulated camera backend and handler threads
//! - [`config`]: Runtime configuration
//! - [`errors`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use camera_lifecycle::backends::SimulatedCameraProvider;
//! use camera_lifecycle::concurrency::Lifetime;
//! use camera_lifecycle::config::SimulationConfig;
//! use camera_lifecycle::device::{ActiveCameraDeviceTracker, ApiType, CameraId, DeviceKey};
//! use camera_lifecycle::MultiDeviceArbiter;
//! use std::sync::Arc;
//!
//! let provider = SimulatedCameraProvider::new(SimulationConfig::default()).unwrap();
//! let arbiter = MultiDeviceArbiter::new(Arc::new(ActiveCameraDeviceTracker::new()));
//!
//! let lifetime = Lifetime::new();
//! let key = DeviceKey::new(ApiType::Camera2, CameraId::from_legacy(0));
//! let camera = arbiter.open_device(&lifetime, key, &provider).get().unwrap();
//! println!("opened {}", camera);
//!
//! // Releasing the lifetime closes the camera.
//! lifetime.dispose();
//! ```

pub mod backends;
pub mod concurrency;
pub mod config;
pub mod constants;
pub mod device;
pub mod errors;

// Re-export commonly used types
pub use concurrency::{FutureResult, Lifetime};
pub use config::LifecycleConfig;
pub use device::{DeviceKey, MultiDeviceArbiter};
pub use errors::{DeviceError, LifecycleError, LifecycleResult};
