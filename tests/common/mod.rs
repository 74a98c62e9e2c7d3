//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use labhost::modules::default_registry;
use labhost::{Config, ModuleManager, ModuleRegistry, ThreadManager};

/// A module manager wired to the built-in registry with isolated state and
/// data directories.
pub struct TestHost {
    pub manager: ModuleManager,
    pub threads: Arc<ThreadManager>,
    pub dir: TempDir,
}

impl TestHost {
    pub fn from_yaml(yaml: &str) -> Self {
        Self::with_registry(yaml, default_registry())
    }

    pub fn with_registry(yaml: &str, registry: ModuleRegistry) -> Self {
        let raw = serde_yaml::from_str(yaml).expect("test config is valid YAML");
        let config = Config::validate_value(raw).expect("test config validates");
        Self::build(&config, registry)
    }

    pub fn build(config: &Config, registry: ModuleRegistry) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let threads = Arc::new(ThreadManager::new());
        let manager = ModuleManager::from_config(
            config,
            Arc::new(registry),
            threads.clone(),
            dir.path().join("state"),
            dir.path().join("data"),
        )
        .expect("manager builds");
        Self {
            manager,
            threads,
            dir,
        }
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.manager.deactivate_all();
        self.threads.shutdown();
    }
}

/// Two hardware modules and two logic modules with a hardware → logic
/// connector chain, the canonical lab layout used across the suites.
pub const LAB_CONFIG: &str = r#"
hardware:
  switchboard:
    module.Class: labhost.hardware.switchboard.SwitchBoard
    allow_remote: true
  cam:
    module.Class: labhost.hardware.dummy_camera.DummyCamera
    options:
      exposure_ms: 5.0
      resolution: [8, 8]

logic:
  counter:
    module.Class: labhost.logic.counter.CounterLogic
    connect:
      switch: switchboard
  scan:
    module.Class: labhost.logic.scan.ScanLogic
    options:
      scan_points: 3
    connect:
      camera: cam
"#;
