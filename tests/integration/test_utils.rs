//! Shared test utilities for integration tests
//!
//! Volume fixtures for capture tests, plus serialized access to the
//! environment variables the config loader reads.

use std::sync::Mutex;
use tempfile::TempDir;
use volcap::config::CaptureConfig;
use volcap::error::CaptureError;
use volcap::security::SecurityData;
use volcap::store::StreamStore;
use volcap::tree::{capture, CaptureStats, CapturedImage, Dentry, ImageCapture};
use volcap::volume::MemoryVolume;

/// Device name every memory fixture is registered under
pub const DEVICE: &str = "mem0";

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Capture a memory volume with default options
pub fn capture_image(volume: &MemoryVolume) -> Result<CapturedImage, CaptureError> {
    ImageCapture::new(DEVICE).run(volume)
}

/// Outputs of a capture that are kept even when it fails
pub struct PartialCapture {
    pub root: Dentry,
    pub store: StreamStore,
    pub security: SecurityData,
    pub result: Result<CaptureStats, CaptureError>,
}

/// Capture through the lower-level entry point so partial state can be
/// inspected after a failure.
pub fn capture_partial(volume: &MemoryVolume, config: &CaptureConfig) -> PartialCapture {
    let mut root = Dentry::root();
    let mut store = StreamStore::new();
    let mut security = SecurityData::new();
    let result = capture(volume, DEVICE, &mut root, &mut store, &mut security, config);
    PartialCapture {
        root,
        store,
        security,
        result,
    }
}

/// Environment variable state to restore after test
struct EnvState {
    vars: Vec<(&'static str, Option<String>)>,
}

impl EnvState {
    fn capture(names: &[&'static str]) -> Self {
        Self {
            vars: names
                .iter()
                .map(|name| (*name, std::env::var(name).ok()))
                .collect(),
        }
    }

    fn restore(self) {
        for (name, value) in self.vars {
            match value {
                Some(orig) => std::env::set_var(name, orig),
                None => std::env::remove_var(name),
            }
        }
    }
}

/// Run `f` with HOME and XDG_CONFIG_HOME pointing into `test_dir` and the
/// given extra variables set. Everything is restored afterwards.
pub fn with_isolated_env<F, R>(test_dir: &TempDir, vars: &[(&'static str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let mut names = vec!["HOME", "XDG_CONFIG_HOME"];
    names.extend(vars.iter().map(|(name, _)| *name));
    let env_state = EnvState::capture(&names);

    let test_config_home = test_dir.path().join("xdg");
    let test_home = test_dir.path().join("home");
    std::fs::create_dir_all(&test_config_home).unwrap();
    std::fs::create_dir_all(&test_home).unwrap();

    std::env::set_var("HOME", test_home.to_str().unwrap());
    std::env::set_var("XDG_CONFIG_HOME", test_config_home.to_str().unwrap());
    for (name, value) in vars {
        std::env::set_var(name, value);
    }

    let result = f();

    env_state.restore();

    result
}
