// SPDX-License-Identifier: GPL-3.0-only

use camera_lifecycle::LifecycleError;
use camera_lifecycle::config::{LifecycleConfig, SimulationConfig};
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_missing_file_gives_defaults() {
    let dir = tempdir().unwrap();
    let config = LifecycleConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
    assert_eq!(config, LifecycleConfig::default());
}

#[test]
fn test_malformed_file_is_config_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    match LifecycleConfig::load(Some(&path)) {
        Err(LifecycleError::Config(message)) => assert!(message.contains("config.json")),
        other => panic!("expected a config error, got {:?}", other),
    }
}

#[test]
fn test_save_then_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let config = LifecycleConfig {
        log_filter: "camera_lifecycle=debug".to_string(),
        shutdown_timeout_ms: 750,
        simulation: SimulationConfig {
            camera_count: 4,
            failing_cameras: vec!["2".to_string()],
            ..SimulationConfig::default()
        },
        ..LifecycleConfig::default()
    };
    config.save(&path).unwrap();

    let loaded = LifecycleConfig::load(Some(&path)).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.shutdown_timeout(), Duration::from_millis(750));
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "simulation": { "open_latency_ms": 1 } }"#).unwrap();

    let config = LifecycleConfig::load(Some(&path)).unwrap();
    assert_eq!(config.simulation.open_latency_ms, 1);
    assert_eq!(
        config.simulation.camera_count,
        SimulationConfig::default().camera_count
    );
    assert_eq!(config.log_filter, LifecycleConfig::default().log_filter);
}
