use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::generation::http::DEFAULT_API_BASE_URL;
use crate::generation::pool::PoolSettings;
use crate::generation::GenerationSettings;
use crate::rate_limit::RateLimitSettings;
use crate::store::StoreSettings;
use crate::worker::WorkerSettings;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "BULKGEN_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub generation: GenerationConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Where generated media is written; relative paths resolve against the
    /// data directory.
    pub media_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub failure_threshold: u32,
    pub max_active_jobs: usize,
    pub retention_days: i64,
    pub flush_debounce_ms: u64,
    pub safety_flush_interval_ms: u64,
    pub context_max_uses: u32,
    pub pool_capacity: usize,
    pub cleanup_probability_denominator: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_base_url: String,
    pub mock_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub video_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("images"),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            base_delay_ms: 4_000,
            max_delay_ms: 60_000,
            failure_threshold: BackoffPolicy::DEFAULT_ABORT_THRESHOLD,
            max_active_jobs: 3,
            retention_days: 7,
            flush_debounce_ms: 2_000,
            safety_flush_interval_ms: 30_000,
            context_max_uses: 10,
            pool_capacity: 5,
            cleanup_probability_denominator: 1_200,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            mock_delay_ms: 1_500,
            request_timeout_secs: 60,
            video_timeout_secs: 150,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 20,
        }
    }
}

impl AppConfig {
    /// A missing or blank file yields the defaults; a malformed one is an
    /// error so a typo never silently resets settings.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// Write through a sibling temp file and rename it over `path`.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .with_context(|| format!("config path has no parent: {}", path.display()))?;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let staged = path.with_extension("toml.tmp");
        let body = toml::to_string_pretty(self).context("failed to encode config")?;
        fs::write(&staged, body).with_context(|| format!("failed to write {}", staged.display()))?;
        fs::rename(&staged, path).with_context(|| format!("failed to replace {}", path.display()))
    }

    pub fn media_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.storage.media_dir)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            max_active_jobs: self.queue.max_active_jobs.max(1),
            retention: chrono::Duration::days(self.queue.retention_days.max(0)),
            flush_debounce: Duration::from_millis(self.queue.flush_debounce_ms),
            safety_flush_interval: Duration::from_millis(self.queue.safety_flush_interval_ms.max(1)),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.queue.base_delay_ms),
            cap: Duration::from_millis(self.queue.max_delay_ms.max(self.queue.base_delay_ms)),
            abort_threshold: self.queue.failure_threshold.max(1),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms.max(1)),
            backoff: self.backoff_policy(),
            pool: PoolSettings {
                capacity: self.queue.pool_capacity.max(1),
                context_max_uses: self.queue.context_max_uses.max(1),
            },
            cleanup_probability_denominator: self.queue.cleanup_probability_denominator.max(1),
            ..WorkerSettings::default()
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            api_base_url: self.generation.api_base_url.clone(),
            mock_delay: Duration::from_millis(self.generation.mock_delay_ms),
            request_timeout: Duration::from_secs(self.generation.request_timeout_secs),
        }
    }

    pub fn video_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.video_timeout_secs)
    }

    pub fn rate_limit_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            window: Duration::from_secs(self.rate_limit.window_secs),
            max_requests: self.rate_limit.max_requests,
        }
    }
}

/// `--data-dir`, then `BULKGEN_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(ENV_DATA_DIR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Make sure the data directory exists and holds a config file. Returns
/// `true` when a default config was written.
pub fn initialize_data_dir(data_dir: &Path) -> Result<bool> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let path = config_path(data_dir);
    if path.exists() {
        return Ok(false);
    }
    AppConfig::default().save_to_path(&path)?;
    Ok(true)
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tuning() {
        let cfg = AppConfig::default();

        assert_eq!((cfg.server.host.as_str(), cfg.server.port), ("0.0.0.0", 3000));
        assert_eq!(cfg.queue.poll_interval_ms, 3_000);
        assert_eq!(cfg.queue.failure_threshold, 5);
        assert_eq!(cfg.queue.max_active_jobs, 3);
        assert_eq!(cfg.generation.mock_delay_ms, 1_500);
        assert_eq!(cfg.rate_limit.max_requests, 20);

        assert_eq!(cfg.backoff_policy(), BackoffPolicy::server());
        assert_eq!(cfg.store_settings(), StoreSettings::default());
        assert_eq!(cfg.worker_settings(), WorkerSettings::default());
        assert_eq!(cfg.rate_limit_settings(), RateLimitSettings::default());
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let cfg: AppConfig =
            toml::from_str("[queue]\nbase_delay_ms = 100\nmax_delay_ms = 50\n").unwrap();
        assert_eq!(cfg.queue.poll_interval_ms, 3_000);
        assert_eq!(cfg.server, ServerConfig::default());

        let policy = cfg.backoff_policy();
        assert_eq!(policy.base, Duration::from_millis(100));
        assert_eq!(policy.cap, Duration::from_millis(100), "cap never below base");
    }

    #[test]
    fn zero_values_are_clamped_to_usable_settings() {
        let mut cfg = AppConfig::default();
        cfg.queue.max_active_jobs = 0;
        cfg.queue.pool_capacity = 0;
        cfg.queue.cleanup_probability_denominator = 0;

        assert_eq!(cfg.store_settings().max_active_jobs, 1);
        let worker = cfg.worker_settings();
        assert_eq!(worker.pool.capacity, 1);
        assert_eq!(worker.cleanup_probability_denominator, 1);
    }

    #[test]
    fn missing_and_blank_files_load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());

        fs::write(&path, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        fs::write(&path, "[queue\n").unwrap();
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));
    }

    #[test]
    fn save_then_load_keeps_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut cfg = AppConfig::default();
        cfg.generation.mock_delay_ms = 0;
        cfg.storage.media_dir = PathBuf::from("/srv/media");

        cfg.save_to_path(&path).unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), cfg);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn data_dir_prefers_cli_then_env() {
        assert_eq!(data_dir(Some(Path::new("/custom"))), PathBuf::from("/custom"));

        env::set_var(ENV_DATA_DIR, "/from-env");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(from_env, PathBuf::from("/from-env"));
    }

    #[test]
    fn media_dir_resolves_against_data_dir() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.media_dir(Path::new("/data")), PathBuf::from("/data/images"));
        cfg.storage.media_dir = PathBuf::from("/srv/media");
        assert_eq!(cfg.media_dir(Path::new("/data")), PathBuf::from("/srv/media"));
    }

    #[test]
    fn initialize_writes_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("fresh");

        assert!(initialize_data_dir(&data).unwrap());
        let path = config_path(&data);
        fs::write(&path, "[server]\nport = 9999\n").unwrap();

        assert!(!initialize_data_dir(&data).unwrap());
        assert_eq!(AppConfig::load_from_path(&path).unwrap().server.port, 9999);
    }
}
