// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

/// Configuration file location
pub mod config_file {
    /// Directory under the platform config dir
    pub const APP_DIR: &str = "camera-lifecycle";

    /// File name of the JSON configuration
    pub const FILE_NAME: &str = "config.json";
}

/// Default log filter when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Timing defaults
pub mod timing {
    /// How long the CLI waits for the arbiter to finish shutting down
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

    /// How long the CLI waits for a single device request
    pub const REQUEST_TIMEOUT_MS: u64 = 5_000;

    /// Simulated time the hardware takes to open a camera
    pub const OPEN_LATENCY_MS: u64 = 30;

    /// Simulated time the hardware takes to close a camera
    pub const CLOSE_LATENCY_MS: u64 = 15;
}

/// Simulated backend constants
pub mod simulation {
    /// Number of cameras the simulated backend exposes by default
    pub const CAMERA_COUNT: u32 = 2;

    /// Error id reported for cameras configured to fail opening
    pub const OPEN_ERROR_CODE: i32 = 3;

    /// Name of the shared background executor thread
    pub const BACKGROUND_THREAD_NAME: &str = "camera-background";

    /// Prefix of per-session callback thread names
    pub const SESSION_THREAD_PREFIX: &str = "camera-session";
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}
