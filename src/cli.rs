// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands driving the lifecycle against the simulated backend
//!
//! This module provides command-line functionality for:
//! - A guided open / switch / shutdown demo
//! - Concurrent open storms across several cameras
//! - Replaying a JSON script of open and release steps

use camera_lifecycle::backends::{SimulatedCamera, SimulatedCameraProvider};
use camera_lifecycle::concurrency::{FutureResult, Lifetime};
use camera_lifecycle::config::LifecycleConfig;
use camera_lifecycle::device::{ActiveCameraDeviceTracker, ApiType, CameraId, DeviceKey};
use camera_lifecycle::errors::LifecycleError;
use camera_lifecycle::MultiDeviceArbiter;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Everything a command needs to talk to the lifecycle
struct Session {
    config: LifecycleConfig,
    tracker: ActiveCameraDeviceTracker,
    arbiter: MultiDeviceArbiter,
    provider: Arc<SimulatedCameraProvider>,
}

impl Session {
    fn new(config: LifecycleConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let tracker = ActiveCameraDeviceTracker::new();
        let arbiter = MultiDeviceArbiter::new(Arc::new(tracker.clone()));
        let provider = Arc::new(SimulatedCameraProvider::new(config.simulation.clone())?);
        Ok(Self {
            config,
            tracker,
            arbiter,
            provider,
        })
    }

    /// Shut the arbiter down when Ctrl+C is pressed
    fn install_interrupt_handler(&self) -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        let arbiter = self.arbiter.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
            let _ = arbiter.shutdown();
        })?;
        Ok(interrupted)
    }

    fn open(&self, lifetime: &Lifetime, key: DeviceKey) -> FutureResult<SimulatedCamera> {
        self.arbiter.open_device(lifetime, key, self.provider.as_ref())
    }

    fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        let started = Instant::now();
        self.arbiter
            .shutdown()
            .get_timeout(self.config.shutdown_timeout())?;
        println!(
            "Shutdown complete in {:.1}ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    fn print_summary(&self) {
        println!();
        println!("Tracker events:");
        for event in self.tracker.events() {
            println!("  {}", event);
        }
        if let Some(camera) = self.tracker.active_or_previous_camera() {
            println!("Last active camera: {}", camera);
        }

        let stats = self.provider.stats();
        println!();
        println!("Opens: {}", stats.total_opens());
        println!("Closes: {}", stats.total_closes());
        println!("Max devices open at once: {}", stats.max_open());
    }
}

fn camera_key(api: ApiType, camera: &str) -> DeviceKey {
    DeviceKey::new(api, CameraId::new(camera))
}

/// Open the first camera, switch to the second, then shut down
pub fn run_demo(config: LifecycleConfig, api: ApiType) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new(config)?;
    session.install_interrupt_handler()?;

    let cameras = session.provider.cameras();
    let (Some(first), Some(second)) = (cameras.first(), cameras.get(1)) else {
        return Err("the demo needs at least two simulated cameras".into());
    };
    let timeout = session.config.request_timeout();

    let lifetime = Lifetime::new();
    println!("Opening camera {}...", first);
    let device = session
        .open(&lifetime, DeviceKey::new(api, first.clone()))
        .get_timeout(timeout)?;
    println!("Opened: {}", device);

    println!("Switching to camera {}...", second);
    let switched = session
        .open(&lifetime, DeviceKey::new(api, second.clone()))
        .get_timeout(timeout)?;
    println!("Opened: {}", switched);

    println!("Shutting down...");
    session.shutdown()?;
    lifetime.dispose();

    session.print_summary();
    Ok(())
}

/// Outcome counters for the cycle command
#[derive(Debug, Default)]
struct Tally {
    opened: AtomicUsize,
    cancelled: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
}

/// Hammer the arbiter with concurrent open requests across cameras
pub fn run_cycle(
    config: LifecycleConfig,
    cameras: u32,
    iterations: usize,
    concurrency: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config;
    config.simulation.camera_count = cameras.max(1);
    let session = Arc::new(Session::new(config)?);
    let interrupted = session.install_interrupt_handler()?;
    let tally = Arc::new(Tally::default());

    println!(
        "Cycling {} cameras, {} workers x {} iterations",
        cameras.max(1),
        concurrency,
        iterations
    );

    let started = Instant::now();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut tasks = Vec::with_capacity(concurrency);
        for worker in 0..concurrency {
            let session = Arc::clone(&session);
            let tally = Arc::clone(&tally);
            let interrupted = Arc::clone(&interrupted);
            tasks.push(tokio::spawn(async move {
                let cameras = session.provider.cameras();
                let timeout = session.config.request_timeout();
                for iteration in 0..iterations {
                    if interrupted.load(Ordering::SeqCst) {
                        break;
                    }
                    let camera = &cameras[(worker + iteration) % cameras.len()];
                    let lifetime = Lifetime::new();
                    let future = session.open(&lifetime, DeviceKey::new(ApiType::Camera2, camera.clone()));

                    match tokio::time::timeout(timeout, future).await {
                        Ok(Ok(_device)) => {
                            tally.opened.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(Err(LifecycleError::Cancelled)) => {
                            tally.cancelled.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Err(e)) => {
                            warn!(worker, camera = %camera, error = %e, "Open failed");
                            tally.failed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(_) => {
                            tally.timed_out.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    lifetime.dispose();
                }
            }));
        }
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Cycle worker panicked");
            }
        }
    });

    session.shutdown()?;

    println!();
    println!("Finished in {:.2}s", started.elapsed().as_secs_f64());
    println!("Opened:    {}", tally.opened.load(Ordering::SeqCst));
    println!("Cancelled: {}", tally.cancelled.load(Ordering::SeqCst));
    println!("Failed:    {}", tally.failed.load(Ordering::SeqCst));
    println!("Timed out: {}", tally.timed_out.load(Ordering::SeqCst));
    session.print_summary();

    let max_open = session.provider.stats().max_open();
    if max_open > 1 {
        return Err(format!("{} devices were open at the same time", max_open).into());
    }
    Ok(())
}

/// One step of a lifecycle script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScriptStep {
    /// Request a camera under a named lifetime
    Open {
        camera: String,
        #[serde(default)]
        api: Option<String>,
        #[serde(default)]
        name: Option<String>,
        /// Block until the request resolves
        #[serde(default)]
        wait: bool,
    },
    /// Dispose a named lifetime
    Release { name: String },
    /// Sleep
    Wait { ms: u64 },
    /// Shut the arbiter down and wait for it
    Shutdown,
}

fn parse_script(json: &str) -> Result<Vec<ScriptStep>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Replay a JSON list of steps
pub fn run_script(config: LifecycleConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let steps = parse_script(&contents)?;
    info!(path = %path.display(), steps = steps.len(), "Running script");

    let session = Session::new(config)?;
    let interrupted = session.install_interrupt_handler()?;
    let timeout = session.config.request_timeout();
    let mut requests: HashMap<String, (Lifetime, FutureResult<SimulatedCamera>)> = HashMap::new();

    for (index, step) in steps.into_iter().enumerate() {
        if interrupted.load(Ordering::SeqCst) {
            println!("Interrupted");
            break;
        }

        match step {
            ScriptStep::Open {
                camera,
                api,
                name,
                wait,
            } => {
                let api = match api {
                    Some(api) => api.parse::<ApiType>()?,
                    None => ApiType::default(),
                };
                let name = name.unwrap_or_else(|| format!("step-{}", index));
                let lifetime = Lifetime::new();
                let future = session.open(&lifetime, camera_key(api, &camera));
                println!("[{}] open {} as '{}'", index, camera_key(api, &camera), name);

                if wait {
                    match future.get_timeout(timeout) {
                        Ok(device) => println!("[{}]   opened {}", index, device),
                        Err(e) => println!("[{}]   {}", index, e),
                    }
                }
                if let Some((previous, _)) = requests.insert(name, (lifetime, future)) {
                    previous.dispose();
                }
            }
            ScriptStep::Release { name } => match requests.remove(&name) {
                Some((lifetime, future)) => {
                    lifetime.dispose();
                    println!("[{}] release '{}' ({})", index, name, describe(&future));
                }
                None => println!("[{}] release '{}': no such request", index, name),
            },
            ScriptStep::Wait { ms } => {
                std::thread::sleep(Duration::from_millis(ms));
            }
            ScriptStep::Shutdown => {
                println!("[{}] shutdown", index);
                session.shutdown()?;
            }
        }
    }

    println!();
    println!("Requests still held:");
    let mut names: Vec<_> = requests.keys().cloned().collect();
    names.sort();
    for name in names {
        if let Some((_, future)) = requests.get(&name) {
            println!("  {}: {}", name, describe(future));
        }
    }

    session.shutdown()?;
    for (_, (lifetime, _)) in requests {
        lifetime.dispose();
    }
    session.print_summary();
    Ok(())
}

fn describe(future: &FutureResult<SimulatedCamera>) -> String {
    if !future.is_done() {
        return "pending".to_string();
    }
    match future.get_timeout(Duration::ZERO) {
        Ok(device) => format!("opened {}", device),
        Err(e) => e.to_string(),
    }
}

/// Print the effective configuration, optionally writing it out
pub fn show_config(
    config: &LifecycleConfig,
    write_to: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(config)?);

    if let Some(path) = write_to {
        config.save(&path)?;
        println!("Configuration written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script() {
        let steps = parse_script(
            r#"[
                { "op": "open", "camera": "0", "name": "front", "wait": true },
                { "op": "open", "camera": "1", "api": "camera1" },
                { "op": "wait", "ms": 20 },
                { "op": "release", "name": "front" },
                { "op": "shutdown" }
            ]"#,
        )
        .unwrap();

        assert_eq!(steps.len(), 5);
        assert_eq!(
            steps[0],
            ScriptStep::Open {
                camera: "0".into(),
                api: None,
                name: Some("front".into()),
                wait: true,
            }
        );
        assert_eq!(steps[2], ScriptStep::Wait { ms: 20 });
        assert_eq!(steps[4], ScriptStep::Shutdown);
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        assert!(parse_script(r#"[{ "op": "explode" }]"#).is_err());
    }
}
