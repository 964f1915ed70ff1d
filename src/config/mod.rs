//! Process-wide configuration.
//!
//! Persisted as camelCase JSON at `$HOME/.claude-api-server/config.json`.
//! Environment variables override the bind address (`PORT`, `HOST`); the
//! path detector proposes `agentPath`/`toolchainBin` updates at startup and
//! on reload.

pub mod detect;
pub mod reload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Shared handle to the live configuration.
pub type SharedConfig = Arc<RwLock<Config>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskQueueConfig {
    /// Maximum number of tasks executing at once.
    pub concurrency: usize,
    /// Per-task timeout in milliseconds.
    pub default_timeout: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            default_timeout: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Fixed window length in milliseconds.
    pub window_ms: u64,
    /// Maximum requests per window per client address.
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub enabled: bool,
    /// Fallback delivery URL when a task carries none.
    pub default_url: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout: u64,
    /// Maximum delivery attempts.
    pub retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_url: None,
            timeout: 10_000,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatisticsConfig {
    pub enabled: bool,
    /// Sampler interval in milliseconds.
    pub collection_interval: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval: 60_000,
        }
    }
}

/// The process-wide configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub port: u16,
    pub host: String,
    /// Absolute path to the agent CLI binary.
    pub agent_path: Option<String>,
    /// Directory prepended to `PATH` in the child environment.
    pub toolchain_bin: Option<String>,
    pub default_project_path: String,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub session_retention_days: u32,
    pub task_queue: TaskQueueConfig,
    pub rate_limit: RateLimitConfig,
    pub webhook: WebhookConfig,
    pub statistics: StatisticsConfig,
    pub default_model: String,
    pub max_budget_usd: Option<f64>,
    pub log_level: String,
    /// When true and the process runs as root, the child environment gets
    /// `IS_SANDBOX=1` so the agent CLI accepts the superuser identity.
    pub enable_root_compatibility: bool,
}

impl Default for Config {
    fn default() -> Self {
        let base = base_dir();
        Self {
            port: 3100,
            host: "127.0.0.1".to_string(),
            agent_path: None,
            toolchain_bin: None,
            default_project_path: home_dir().to_string_lossy().into_owned(),
            data_dir: base.join("data"),
            log_file: base.join("logs").join("server.log"),
            pid_file: base.join("server.pid"),
            session_retention_days: 30,
            task_queue: TaskQueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            webhook: WebhookConfig::default(),
            statistics: StatisticsConfig::default(),
            default_model: "claude-sonnet-4".to_string(),
            max_budget_usd: None,
            log_level: "info".to_string(),
            enable_root_compatibility: false,
        }
    }
}

impl Config {
    /// Load the configuration file, writing defaults when it is absent.
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            Ok(config)
        }
    }

    /// Persist the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `PORT` and `HOST` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring unparseable PORT override: {}", port),
            }
        }
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
    }

    /// Create the data and log directories this configuration points at.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.pid_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Directory holding the configuration file, logs, and data.
pub fn base_dir() -> PathBuf {
    home_dir().join(".claude-api-server")
}

/// Default location of `config.json`.
pub fn default_config_path() -> PathBuf {
    base_dir().join("config.json")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Whether the process runs with a superuser effective uid.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.task_queue.concurrency, 3);
        assert_eq!(config.task_queue.default_timeout, 300_000);
        assert_eq!(config.session_retention_days, 30);

        // A second load returns the persisted document unchanged.
        let reloaded = Config::load_or_init(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_camel_case_keys_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"taskQueue\""));
        assert!(raw.contains("\"defaultTimeout\""));
        assert!(raw.contains("\"sessionRetentionDays\""));
        assert!(raw.contains("\"enableRootCompatibility\""));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "taskQueue": {"concurrency": 7}}"#).unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.task_queue.concurrency, 7);
        // Unspecified fields keep their defaults.
        assert_eq!(config.task_queue.default_timeout, 300_000);
        assert_eq!(config.host, "127.0.0.1");
    }
}
