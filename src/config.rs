//! Endpoint configuration and directory layout (A1 / spec §6).

use crate::error::InterchangeError;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

/// User-authored configuration. The loader here is intentionally simple
/// (TOML via `toml`); most of the values it carries are the ones the core
/// cares about, per spec §6: "values the core cares about: executor spec,
/// strategy parameters, broker address overrides."
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EndpointConfig {
    /// Command (and args) used to launch one worker process.
    pub worker_command: Vec<String>,
    pub min_blocks: usize,
    pub max_blocks: usize,
    pub max_idletime_secs: u64,
    pub tick_interval_secs: u64,
    pub prefetch_multiplier: u16,
    pub drain_deadline_secs: u64,
    /// Overrides the broker address handed back by registration, if set.
    pub broker_url_override: Option<String>,
    pub control_plane_url: String,
    pub endpoint_name: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            worker_command: vec!["endpoint-worker".to_string()],
            min_blocks: 0,
            max_blocks: 4,
            max_idletime_secs: 120,
            tick_interval_secs: 5,
            prefetch_multiplier: 2,
            drain_deadline_secs: 30,
            broker_url_override: None,
            control_plane_url: "https://compute.example.org/v2".to_string(),
            endpoint_name: "default".to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn max_idletime(&self) -> Duration {
        Duration::from_secs(self.max_idletime_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, InterchangeError> {
        if !path.exists() {
            let default = Self::default();
            default.save(path)?;
            return Ok(default);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| InterchangeError::FatalConfig(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| InterchangeError::FatalConfig(format!("parsing {}: {e}", path.display())))
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), InterchangeError> {
        let body = toml::to_string_pretty(self)
            .map_err(|e| InterchangeError::FatalConfig(format!("serializing config: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, body)?;
        Ok(())
    }
}

/// Resolves the endpoint directory layout named in spec §6.
#[derive(Clone, Debug)]
pub struct EndpointPaths {
    root: PathBuf,
}

impl EndpointPaths {
    /// Default root is `~/.endpoint_interchange/<name>`, with any
    /// `~`-prefixed override expanded via `shellexpand`.
    pub fn new(root_override: Option<&str>, endpoint_name: &str) -> Result<Self, InterchangeError> {
        let root = match root_override {
            Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
            None => dirs::home_dir()
                .ok_or_else(|| InterchangeError::FatalConfig("no home directory".to_string()))?
                .join(".endpoint_interchange")
                .join(endpoint_name),
        };
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("unacked_results"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn registration_file(&self) -> PathBuf {
        self.root.join("endpoint.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("daemon.lock")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.root.join("unacked_results")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("interchange.log")
    }
}
