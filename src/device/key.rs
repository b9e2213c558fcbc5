// SPDX-License-Identifier: GPL-3.0-only

//! Identity of a physical camera opened through a specific API

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Camera API a device is opened through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ApiType {
    /// Legacy camera API
    Camera1,
    /// Current camera API
    #[default]
    Camera2,
    /// Portability layer, backing API picked automatically
    PortabilityAuto,
    /// Portability layer backed by the legacy API
    PortabilityApi1,
    /// Portability layer backed by the current API
    PortabilityApi2,
}

impl ApiType {
    /// Every API variant, for iteration
    pub const ALL: [ApiType; 5] = [
        ApiType::Camera1,
        ApiType::Camera2,
        ApiType::PortabilityAuto,
        ApiType::PortabilityApi1,
        ApiType::PortabilityApi2,
    ];
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiType::Camera1 => write!(f, "camera1"),
            ApiType::Camera2 => write!(f, "camera2"),
            ApiType::PortabilityAuto => write!(f, "portability-auto"),
            ApiType::PortabilityApi1 => write!(f, "portability-api1"),
            ApiType::PortabilityApi2 => write!(f, "portability-api2"),
        }
    }
}

impl std::str::FromStr for ApiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApiType::ALL
            .into_iter()
            .find(|api| api.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown camera API '{}'", s))
    }
}

/// Physical camera identifier.
///
/// Cameras can be addressed by their string id or by the legacy integer
/// index. Equality and hashing only look at the string value, so both
/// spellings of the same camera compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraId {
    value: String,
    legacy_value: Option<u32>,
}

impl CameraId {
    /// Camera addressed by its string id
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let legacy_value = value.parse().ok();
        Self {
            value,
            legacy_value,
        }
    }

    /// Camera addressed by its legacy integer index
    pub fn from_legacy(index: u32) -> Self {
        Self {
            value: index.to_string(),
            legacy_value: Some(index),
        }
    }

    /// String id of the camera
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Legacy integer index, if the id has one
    pub fn legacy_value(&self) -> Option<u32> {
        self.legacy_value
    }
}

impl PartialEq for CameraId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for CameraId {}

impl Hash for CameraId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A physical camera together with the API used to open it.
///
/// The same camera under two different APIs is two different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    api: ApiType,
    camera: CameraId,
}

impl DeviceKey {
    /// Build a key from its parts
    pub fn new(api: ApiType, camera: CameraId) -> Self {
        Self { api, camera }
    }

    /// API variant of this key
    pub fn api(&self) -> ApiType {
        self.api
    }

    /// Physical camera of this key
    pub fn camera_id(&self) -> &CameraId {
        &self.camera
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.api, self.camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_legacy_and_string_ids_compare_equal() {
        let legacy = CameraId::from_legacy(1);
        let named = CameraId::new("1");
        assert_eq!(legacy, named);
        assert_eq!(named.legacy_value(), Some(1));
        assert_eq!(CameraId::new("front").legacy_value(), None);
    }

    #[test]
    fn test_api_variant_distinguishes_keys() {
        let a = DeviceKey::new(ApiType::Camera1, CameraId::from_legacy(0));
        let b = DeviceKey::new(ApiType::Camera2, CameraId::new("0"));
        let c = DeviceKey::new(ApiType::Camera2, CameraId::from_legacy(0));
        assert_ne!(a, b);
        assert_eq!(b, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_api_type_round_trips_through_display() {
        for api in ApiType::ALL {
            assert_eq!(api.to_string().parse::<ApiType>(), Ok(api));
        }
        assert!("camera3".parse::<ApiType>().is_err());
    }

    #[test]
    fn test_key_display() {
        let key = DeviceKey::new(ApiType::PortabilityApi2, CameraId::new("back"));
        assert_eq!(key.to_string(), "portability-api2:back");
    }
}
