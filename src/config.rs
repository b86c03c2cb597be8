//! Configuration loaded from `kong.toml`.
//!
//! [`KongConfig`] holds every tunable. Values missing from the file fall
//! back to sensible defaults. The `KONG_DATA_DIR` environment variable takes
//! precedence over the file for the data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Top-level configuration loaded from `kong.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct KongConfig {
    /// Directory holding the hierarchy state, status cache and job artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Driver used when a job does not name one explicitly.
    #[serde(default = "default_driver")]
    pub default_driver: String,

    /// Age in seconds below which a cached status entry is considered fresh.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Bounded wait for the state lock before giving up with `LockTimeout`.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Global default tier of the resource precedence (job > folder > this).
    #[serde(default)]
    pub defaults: ResourceDefaults,

    /// Batch backend command configuration.
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Global fallback resource requests.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDefaults {
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_wall_time_mins")]
    pub wall_time_mins: u32,
}

/// External commands the batch driver shells out to. The textual protocol
/// behind them is backend specific.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_submit_cmd")]
    pub submit_cmd: String,
    #[serde(default = "default_query_cmd")]
    pub query_cmd: String,
    #[serde(default = "default_kill_cmd")]
    pub kill_cmd: String,
    /// Prefix for backend job names; the job id is encoded into the name so
    /// that lost records can be recovered.
    #[serde(default = "default_job_name_prefix")]
    pub job_name_prefix: String,
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kong")
}

fn default_driver() -> String {
    "local".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_cores() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    1000
}

fn default_queue() -> String {
    "normal".to_string()
}

fn default_wall_time_mins() -> u32 {
    60
}

fn default_submit_cmd() -> String {
    "bsub".to_string()
}

fn default_query_cmd() -> String {
    "bjobs".to_string()
}

fn default_kill_cmd() -> String {
    "bkill".to_string()
}

fn default_job_name_prefix() -> String {
    "kong".to_string()
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            memory_mb: default_memory_mb(),
            queue: default_queue(),
            wall_time_mins: default_wall_time_mins(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_cmd: default_submit_cmd(),
            query_cmd: default_query_cmd(),
            kill_cmd: default_kill_cmd(),
            job_name_prefix: default_job_name_prefix(),
        }
    }
}

impl Default for KongConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_driver: default_driver(),
            cache_ttl_secs: default_cache_ttl_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            defaults: ResourceDefaults::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl KongConfig {
    /// Loads the configuration from `kong.toml` in the current directory.
    /// Uses defaults if the file does not exist.
    pub fn load() -> Result<Self> {
        let path = Path::new("kong.toml");
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<KongConfig>(&contents)?
        } else {
            Self::default()
        };

        // Environment variable takes precedence over the config file.
        if let Ok(dir) = std::env::var("KONG_DATA_DIR")
            && !dir.is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// A config rooted at an explicit data directory, used by tests.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn cache_file(&self) -> PathBuf {
        self.data_dir.join("status_cache.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("kong.lock")
    }

    /// Base directory for per-job log artifacts (scripts, stdout, stderr).
    pub fn log_base(&self) -> PathBuf {
        self.data_dir.join("jobdir")
    }

    /// Base directory for per-job output artifacts.
    pub fn output_base(&self) -> PathBuf {
        self.data_dir.join("joboutput")
    }

    /// Base directory for per-job scratch space.
    pub fn scratch_base(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    /// Directory for driver-private submission metadata.
    pub fn driver_meta_dir(&self, driver: &str) -> PathBuf {
        self.data_dir.join("drivers").join(driver)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
