//! Application configuration: JSON file with defaults for every field,
//! validated after load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file; `None` uses `~/.bookforge/data/bookforge.db`.
    pub database_path: Option<PathBuf>,
    /// Root directory for generated artifacts.
    pub storage_directory: PathBuf,
    /// Worker pool size.
    pub worker_count: usize,
    pub generation: GenerationSettings,
    pub keepalive: KeepaliveSettings,
    pub sweeper: SweeperSettings,
    pub text_service: TextServiceSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            storage_directory: PathBuf::from("media"),
            worker_count: num_cpus::get().clamp(2, 8),
            generation: GenerationSettings::default(),
            keepalive: KeepaliveSettings::default(),
            sweeper: SweeperSettings::default(),
            text_service: TextServiceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Whole-run attempts for retryable failures.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay_secs: u64,
    /// Past this, the run is logged as slow but keeps going.
    pub soft_timeout_secs: u64,
    /// Past this, the attempt is terminated and treated as retryable.
    pub hard_timeout_secs: u64,
    /// Per-page illustration fan-out inside one job.
    pub image_concurrency: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 60,
            soft_timeout_secs: 300,
            hard_timeout_secs: 900,
            image_concurrency: 4,
        }
    }
}

impl GenerationSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    pub interval_secs: u64,
    /// No traffic for this long triggers a probe; silence for another
    /// window after the probe disconnects the channel.
    pub idle_window_secs: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            idle_window_secs: 30,
        }
    }
}

impl KeepaliveSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_window_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub interval_secs: u64,
    /// Failed books older than this get reclaimed.
    pub failed_age_hours: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            failed_age_hours: 24,
        }
    }
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn failed_age(&self) -> Duration {
        Duration::from_secs(self.failed_age_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextServiceSettings {
    pub endpoint: String,
    pub model: String,
}

impl Default for TextServiceSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8085/v1/generate".to_string(),
            model: "story-v1".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Validation {
                message: "worker_count must be at least 1".to_string(),
            });
        }
        if self.generation.max_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "generation.max_attempts must be at least 1".to_string(),
            });
        }
        if self.generation.image_concurrency == 0 {
            return Err(ConfigError::Validation {
                message: "generation.image_concurrency must be at least 1".to_string(),
            });
        }
        if self.generation.soft_timeout_secs >= self.generation.hard_timeout_secs {
            return Err(ConfigError::Validation {
                message: "generation.soft_timeout_secs must be below hard_timeout_secs"
                    .to_string(),
            });
        }
        if self.keepalive.idle_window_secs == 0 {
            return Err(ConfigError::Validation {
                message: "keepalive.idle_window_secs must be at least 1".to_string(),
            });
        }
        if self.text_service.endpoint.is_empty() {
            return Err(ConfigError::Validation {
                message: "text_service.endpoint must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads and validates a JSON config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: Config = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
