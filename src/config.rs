//! Startup configuration (SPEC_FULL §C): an optional TOML file plus
//! environment overrides, loaded once and held in `AppState`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub api_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:8787".to_string(),
            api_token_env: "SCHEDULER_API_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { path: "scheduler/tasks.json".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_window_seconds: u64,
    pub max_parallelism: usize,
    pub cancel_grace_seconds: u64,
    pub worker_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_window_seconds: 60,
            max_parallelism: 4,
            cancel_grace_seconds: 30,
            worker_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub default_timezone: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig { default_timezone: "UTC".to_string() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub clock: ClockConfig,
}

impl Config {
    /// Loads `path` if given and present, falling back to defaults for
    /// anything the file doesn't set. The bearer token itself is never read
    /// from the file — only the *name* of the environment variable that holds
    /// it (`server.api_token_env`) — so secrets never round-trip through disk.
    pub fn load(path: Option<&Path>) -> Result<Self, crate::errors::SchedulerError> {
        let config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|e| crate::errors::SchedulerError::IoError { message: e.to_string() })?;
                toml::from_str(&raw).map_err(|e| crate::errors::SchedulerError::CorruptStore { message: e.to_string() })?
            }
            _ => Config::default(),
        };

        if std::env::var(&config.server.api_token_env).is_err() {
            warn!(
                env_var = %config.server.api_token_env,
                "no API token configured — authenticated routes will run unauthenticated (dev mode)"
            );
        }

        Ok(config)
    }

    pub fn api_token(&self) -> Option<String> {
        std::env::var(&self.server.api_token_env).ok()
    }

    pub fn tick_window(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_window_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.scheduler.cancel_grace_seconds)
    }
}
