use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LaunchError;
use crate::paths::*;

/// Tunables for a launch session. Every field has a default so a missing or
/// partial `config.json` still yields a usable configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Display compositor wrapper that sizes each instance's window.
    pub compositor_command: String,
    /// Namespace wrapper that hides every device not assigned to the instance.
    pub sandbox_command: String,
    pub prefix_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub stagger_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    /// Library roots probed before the ones reported by the Steam client.
    pub extra_library_roots: Vec<PathBuf>,
    pub runtime_logging: bool,
    pub dxvk_async: bool,
    pub enable_kwin_script: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            compositor_command: "gamescope".to_string(),
            sandbox_command: "bwrap".to_string(),
            prefix_dir: PATH_PREFIXES.clone(),
            log_dir: PATH_CACHE.join("logs"),
            lock_dir: PATH_CACHE.join("locks"),
            stagger_delay_ms: 5_000,
            poll_interval_ms: 5_000,
            grace_period_ms: 2_000,
            extra_library_roots: Vec::new(),
            runtime_logging: true,
            dxvk_async: true,
            enable_kwin_script: true,
        }
    }
}

impl LaunchConfig {
    pub fn load() -> Result<Self, LaunchError> {
        Self::load_from(&PATH_APP.join("config.json"))
    }

    /// Reads a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, LaunchError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(LaunchError::io(path, e)),
        };
        let cfg: LaunchConfig = serde_json::from_reader(BufReader::new(file))?;
        log::debug!("Loaded launch config from {}", path.display());
        Ok(cfg)
    }

    /// Commands that must resolve before any instance work begins.
    pub fn required_commands(&self) -> [&str; 2] {
        [
            self.compositor_command.as_str(),
            self.sandbox_command.as_str(),
        ]
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
