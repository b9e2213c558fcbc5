// SPDX-License-Identifier: GPL-3.0-only

//! Camera backends implementing the device action seam
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          MultiDeviceArbiter / state machine  │
//! └────────────────────┬────────────────────────┘
//!                      │ DeviceActionProvider
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌──────────────────┐  ┌─────────────────┐  │
//! │  │ background       │  │ session         │  │
//! │  │ HandlerThread    │  │ HandlerThread   │  │
//! │  │ (shared, RefCnt) │  │ (per open)      │  │
//! │  └──────────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`handler_thread`]: named worker threads consuming a job queue
//! - [`simulated`]: simulated cameras with latency and failure injection

pub mod handler_thread;
pub mod simulated;

pub use handler_thread::{HandlerThread, Job, job};
pub use simulated::{DeviceStats, SimulatedCamera, SimulatedCameraProvider};
