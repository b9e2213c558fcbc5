// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the camera device lifecycle

use crate::device::DeviceKey;
use std::fmt;
use std::time::Duration;

/// Result type alias using LifecycleError
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors reported by a device backend while opening or closing a camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Opening the device failed (permissions, contention, hardware)
    OpenFailed(String),
    /// The hardware reported an error id while opening
    ErrorCode(i32),
    /// The device opened, but a close was requested before it could be used
    OpenInterrupted,
    /// The device disconnected while it was being opened
    Disconnected,
    /// Closing the device failed
    CloseFailed(String),
    /// The backend could not run the requested action
    Unavailable(String),
}

/// Errors observed by callers of the lifecycle API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A device backend reported a failure
    Device(DeviceError),
    /// The request was cancelled or superseded before it resolved
    Cancelled,
    /// A blocking wait expired
    Timeout(Duration),
    /// The queue was closed and no more values will arrive
    QueueClosed,
    /// A reference was requested on an already disposed payload
    Disposed,
    /// The key is already open with a different device type
    DeviceTypeMismatch(DeviceKey),
    /// Configuration could not be loaded
    Config(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OpenFailed(msg) => write!(f, "Failed to open device: {}", msg),
            DeviceError::ErrorCode(code) => write!(f, "Device reported error {}", code),
            DeviceError::OpenInterrupted => {
                write!(f, "Device opened after a close was requested")
            }
            DeviceError::Disconnected => write!(f, "Device disconnected"),
            DeviceError::CloseFailed(msg) => write!(f, "Failed to close device: {}", msg),
            DeviceError::Unavailable(msg) => write!(f, "Device action unavailable: {}", msg),
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::Device(e) => write!(f, "Device error: {}", e),
            LifecycleError::Cancelled => write!(f, "Request was cancelled"),
            LifecycleError::Timeout(after) => write!(f, "Timed out after {:?}", after),
            LifecycleError::QueueClosed => write!(f, "Queue is closed"),
            LifecycleError::Disposed => write!(f, "Resource was already disposed"),
            LifecycleError::DeviceTypeMismatch(key) => {
                write!(f, "Device {} is open with a different device type", key)
            }
            LifecycleError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}
impl std::error::Error for LifecycleError {}

impl From<DeviceError> for LifecycleError {
    fn from(err: DeviceError) -> Self {
        LifecycleError::Device(err)
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(err: serde_json::Error) -> Self {
        LifecycleError::Config(err.to_string())
    }
}

impl From<std::io::Error> for LifecycleError {
    fn from(err: std::io::Error) -> Self {
        LifecycleError::Config(err.to_string())
    }
}
