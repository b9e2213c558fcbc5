// SPDX-License-Identifier: GPL-3.0-only

//! Tracking of the camera that is currently active

use super::CameraId;
use crate::concurrency::lock_recover;
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Receives notifications when the arbiter opens or releases a camera
pub trait ActiveDeviceTracker: Send + Sync {
    /// A camera is about to be opened
    fn on_camera_opening(&self, camera: &CameraId);
    /// A camera was closed and nothing replaced it
    fn on_camera_closed(&self, camera: &CameraId);
}

/// Kind of a recorded tracker event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEventKind {
    Opening,
    Closed,
}

/// A timestamped tracker notification
#[derive(Debug, Clone)]
pub struct TrackerEvent {
    pub kind: TrackerEventKind,
    pub camera: CameraId,
    pub at: DateTime<Local>,
}

impl std::fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            TrackerEventKind::Opening => "opening",
            TrackerEventKind::Closed => "closed",
        };
        write!(f, "{} {} {}", self.at.format("%H:%M:%S%.3f"), kind, self.camera)
    }
}

#[derive(Default)]
struct TrackerState {
    active: Option<CameraId>,
    previous: Option<CameraId>,
    events: Vec<TrackerEvent>,
}

/// Remembers the active camera and the one active before it.
///
/// Cloning yields another handle to the same tracker.
#[derive(Clone, Default)]
pub struct ActiveCameraDeviceTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ActiveCameraDeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Camera currently open or opening
    pub fn active_camera(&self) -> Option<CameraId> {
        lock_recover(&self.state).active.clone()
    }

    /// The active camera, or if none, the last camera that was active
    pub fn active_or_previous_camera(&self) -> Option<CameraId> {
        let state = lock_recover(&self.state);
        state.active.clone().or_else(|| state.previous.clone())
    }

    /// Every notification received so far, oldest first
    pub fn events(&self) -> Vec<TrackerEvent> {
        lock_recover(&self.state).events.clone()
    }

    fn record(state: &mut TrackerState, kind: TrackerEventKind, camera: &CameraId) {
        state.events.push(TrackerEvent {
            kind,
            camera: camera.clone(),
            at: Local::now(),
        });
    }
}

impl ActiveDeviceTracker for ActiveCameraDeviceTracker {
    fn on_camera_opening(&self, camera: &CameraId) {
        let mut state = lock_recover(&self.state);
        debug!(camera = %camera, "Camera opening");
        if state.active.as_ref() != Some(camera)
            && let Some(active) = state.active.take()
        {
            state.previous = Some(active);
        }
        state.active = Some(camera.clone());
        Self::record(&mut state, TrackerEventKind::Opening, camera);
    }

    fn on_camera_closed(&self, camera: &CameraId) {
        let mut state = lock_recover(&self.state);
        debug!(camera = %camera, "Camera closed");
        if state.active.as_ref() == Some(camera) {
            state.previous = state.active.take();
        }
        Self::record(&mut state, TrackerEventKind::Closed, camera);
    }
}

impl std::fmt::Debug for ActiveCameraDeviceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_recover(&self.state);
        f.debug_struct("ActiveCameraDeviceTracker")
            .field("active", &state.active)
            .field("previous", &state.previous)
            .finish()
    }
}
