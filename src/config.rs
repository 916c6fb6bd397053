//! Swarm configuration, loaded from `~/.hive/hive.toml` when present.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::{Strategy, DEFAULT_MAX_ATTEMPTS};
use crate::{hlog_debug, Error, Result};

/// Tunables for a [`crate::swarm::Swarm`].
///
/// Interval and timeout fields are plain seconds so the TOML stays flat;
/// the accessor methods return `Duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Maximum workers the swarm will register.
    pub max_workers: usize,
    /// Worker-selection strategy for the scheduler.
    pub strategy: Strategy,
    /// Bounded capacity of each worker mailbox.
    pub mailbox_capacity: usize,
    /// Seconds between health-check passes.
    pub health_check_interval_secs: f64,
    /// Default per-attempt task timeout, applied when a task has none.
    pub task_timeout_secs: f64,
    /// Seconds between task-distribution passes.
    pub distribution_interval_secs: f64,
    /// Per-worker mailbox poll timeout in the message loop.
    pub message_poll_timeout_secs: f64,
    /// Poll interval while a submitter waits for its result.
    pub result_poll_interval_secs: f64,
    /// Grace period past the task timeout before a submit gives up.
    pub result_grace_secs: f64,
    /// Maximum execution attempts per task.
    pub max_task_attempts: u32,
    /// Enable the auto-scaling placeholder loop.
    pub auto_scale: bool,
    /// Lower bound the auto-scaler would respect.
    pub min_workers: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            strategy: Strategy::LoadBalanced,
            mailbox_capacity: 1000,
            health_check_interval_secs: 30.0,
            task_timeout_secs: 300.0,
            distribution_interval_secs: 1.0,
            message_poll_timeout_secs: 0.1,
            result_poll_interval_secs: 0.5,
            result_grace_secs: 10.0,
            max_task_attempts: DEFAULT_MAX_ATTEMPTS,
            auto_scale: false,
            min_workers: 1,
        }
    }
}

impl SwarmConfig {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.task_timeout_secs)
    }

    pub fn distribution_interval(&self) -> Duration {
        Duration::from_secs_f64(self.distribution_interval_secs)
    }

    pub fn message_poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.message_poll_timeout_secs)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.result_poll_interval_secs)
    }

    pub fn result_grace(&self) -> Duration {
        Duration::from_secs_f64(self.result_grace_secs)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        hlog_debug!("SwarmConfig::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        hlog_debug!(
            "config loaded: max_workers={}, strategy={}",
            config.max_workers,
            config.strategy
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let hive_dir = Self::hive_dir()?;
        if !hive_dir.exists() {
            fs::create_dir_all(&hive_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        hlog_debug!("config saved to {}", path.display());
        Ok(())
    }
}
