//! Worker configuration, loaded from `<home>/config.yaml`.
//!
//! ```yaml
//! plugins:
//!   - id: fs
//!     name: Local files
//!     binary_path: dataq-filescan
//!     config:
//!       root: /data/inbox
//! queue:
//!   backend: sqlite
//! poll_interval_ms: 500
//! ```

use dataq_protocol::Config;
use dataq_queue::QueueBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkerError};

/// One configured plugin binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Absolute, or relative to `<state_dir>/bin`
    pub binary_path: PathBuf,
    /// Static configuration sent in the `configure` request
    #[serde(default)]
    pub config: Config,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Defaults to `<state_dir>/queue.sqlite3` (sqlite) or `<state_dir>/queue.log` (file)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Defaults to `<home>/data`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Main configuration for the worker and CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataqConfig {
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub cas: CasConfig,

    /// Plugin working directories live under here. Defaults to `<home>/state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// How long the dequeue loop sleeps when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the dequeue -> dispatch channel
    #[serde(default = "default_task_buffer")]
    pub task_buffer: usize,

    /// Capacity of each plugin's request channel
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,

    /// Tasks popped but not yet finished, across all plugins
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_task_buffer() -> usize {
    16
}

fn default_request_buffer() -> usize {
    1
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for DataqConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            queue: QueueConfig::default(),
            cas: CasConfig::default(),
            state_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            task_buffer: default_task_buffer(),
            request_buffer: default_request_buffer(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl DataqConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: DataqConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.id.trim().is_empty() {
                return Err(WorkerError::config("plugin with empty id"));
            }
            if plugin.id.contains(['/', '\\']) || plugin.id == "." || plugin.id == ".." {
                return Err(WorkerError::config(format!(
                    "plugin id '{}' cannot be used as a directory name",
                    plugin.id
                )));
            }
            if plugin.binary_path.as_os_str().is_empty() {
                return Err(WorkerError::config(format!(
                    "plugin '{}' has no binary_path",
                    plugin.id
                )));
            }
            if !seen.insert(plugin.id.as_str()) {
                return Err(WorkerError::config(format!("duplicate plugin id '{}'", plugin.id)));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(WorkerError::config("poll_interval_ms must be > 0"));
        }
        if self.task_buffer == 0 || self.request_buffer == 0 || self.max_in_flight == 0 {
            return Err(WorkerError::config(
                "task_buffer, request_buffer and max_in_flight must be > 0",
            ));
        }
        Ok(())
    }

    pub fn plugin(&self, id: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.id == id)
    }

    pub fn enabled_plugins(&self) -> impl Iterator<Item = &PluginConfig> {
        self.plugins.iter().filter(|p| p.enabled)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(dataq_logging::state_dir)
    }

    /// Working directory for one plugin's process
    pub fn plugin_work_dir(&self, plugin_id: &str) -> PathBuf {
        self.state_dir().join(plugin_id)
    }

    pub fn resolve_binary(&self, plugin: &PluginConfig) -> PathBuf {
        if plugin.binary_path.is_absolute() {
            plugin.binary_path.clone()
        } else {
            self.state_dir().join("bin").join(&plugin.binary_path)
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        if let Some(path) = &self.queue.path {
            return path.clone();
        }
        let file = match self.queue.backend {
            QueueBackend::File => "queue.log",
            QueueBackend::Sqlite | QueueBackend::Memory => "queue.sqlite3",
        };
        self.state_dir().join(file)
    }

    pub fn cas_path(&self) -> PathBuf {
        self.cas.path.clone().unwrap_or_else(dataq_logging::data_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
