use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "CELSHIFT_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cleanup: CleanupConfig,
    pub stages: StagesConfig,
    pub stylize: StylizeConfig,
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
    /// Root under which per-job workspaces are allocated.
    /// Relative paths are resolved against the data directory.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub max_age_hours: u64,
    pub sweep_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    /// Deadline for a single collaborator invocation (download, extract,
    /// the whole stylize fan-out, reassemble).
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StylizeConfig {
    /// Frame transform backend: "passthrough" or "http".
    pub backend: StylizeBackend,
    /// Endpoint for the http backend.
    pub endpoint: String,
    /// Bounded fan-out width for per-frame transform calls.
    pub workers: usize,
    /// Attempts per frame before the stage gives up on it.
    pub max_attempts: usize,
    /// Base backoff between per-frame attempts; doubled each retry unless
    /// the transform service directs a longer wait.
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StylizeBackend {
    Passthrough,
    Http,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            cleanup: CleanupConfig::default(),
            stages: StagesConfig::default(),
            stylize: StylizeConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_age_hours: 24,
            sweep_interval_minutes: 60,
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self { timeout_secs: 900 }
    }
}

impl Default for StylizeConfig {
    fn default() -> Self {
        Self {
            backend: StylizeBackend::Passthrough,
            endpoint: String::new(),
            workers: 4,
            max_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl CleanupConfig {
    /// Sweep period, clamped to at least one minute so a zero in the
    /// config cannot disable cleanup.
    pub fn effective_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_minutes.max(1) * 60)
    }

    pub fn effective_max_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_age_hours * 3600)
    }
}

impl StylizeConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn effective_max_attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// The workspace root, resolved against the data directory when relative.
    pub fn resolved_work_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.storage.work_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. CELSHIFT_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
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
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.storage.work_dir, PathBuf::from("work"));
        assert_eq!(cfg.cleanup.max_age_hours, 24);
        assert_eq!(cfg.cleanup.sweep_interval_minutes, 60);
        assert_eq!(cfg.stages.timeout_secs, 900);
        assert_eq!(cfg.stylize.backend, StylizeBackend::Passthrough);
        assert_eq!(cfg.stylize.workers, 4);
        assert_eq!(cfg.stylize.max_attempts, 3);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing-config.toml");
        let loaded = AppConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let raw = "[stylize]\nbackend = \"http\"\nendpoint = \"http://transform.local/v1\"\n";
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");

        assert_eq!(cfg.stylize.backend, StylizeBackend::Http);
        assert_eq!(cfg.stylize.endpoint, "http://transform.local/v1");
        assert_eq!(cfg.stylize.workers, 4);
        assert_eq!(cfg.server.port, 8000);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        initialize_data_dir(&data_dir).expect("initialize data dir");

        assert!(data_dir.exists());
        assert!(data_dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().to_path_buf();

        let cfg_path = data_dir.join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&data_dir).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolved_work_dir_joins_relative_and_keeps_absolute() {
        let mut cfg = AppConfig::default();
        assert_eq!(
            cfg.resolved_work_dir(Path::new("/data")),
            PathBuf::from("/data/work")
        );

        cfg.storage.work_dir = PathBuf::from("/scratch/jobs");
        assert_eq!(
            cfg.resolved_work_dir(Path::new("/data")),
            PathBuf::from("/scratch/jobs")
        );
    }

    #[test]
    fn effective_knobs_clamp_zero_values() {
        let cfg = StylizeConfig {
            workers: 0,
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(cfg.effective_workers(), 1);
        assert_eq!(cfg.effective_max_attempts(), 1);
    }

    #[test]
    fn sweep_interval_clamps_zero_to_one_minute() {
        let cfg = CleanupConfig {
            sweep_interval_minutes: 0,
            max_age_hours: 24,
        };
        assert_eq!(
            cfg.effective_sweep_interval(),
            std::time::Duration::from_secs(60)
        );
        assert_eq!(
            cfg.effective_max_age(),
            std::time::Duration::from_secs(24 * 3600)
        );

        let cfg = CleanupConfig::default();
        assert_eq!(
            cfg.effective_sweep_interval(),
            std::time::Duration::from_secs(3600)
        );
    }
}
