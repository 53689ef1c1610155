//! Configuration, loaded from `config.toml` in the app directory

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::observer::ObserverTimings;
use crate::sync::reconciler::DEFAULT_EXCLUDED_SUBPATHS;
use crate::sync::scheduler::SchedulerConfig;

pub const APP_DIR_NAME: &str = "aoe-sync";
pub const HOME_ENV_VAR: &str = "AOE_SYNC_HOME";

/// `$AOE_SYNC_HOME`, else `<config dir>/aoe-sync`. Created if missing.
pub fn get_app_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV_VAR) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .context("Could not determine a configuration directory")?
            .join(APP_DIR_NAME),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create app directory {}", dir.display()))?;
    Ok(dir)
}

fn config_path() -> Result<PathBuf> {
    Ok(get_app_dir()?.join("config.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub filetree: FiletreeConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(load_config()?.unwrap_or_default())
    }

    /// Where the task store lives
    pub fn data_dir(&self) -> Result<PathBuf> {
        Ok(get_app_dir()?.join("tasks"))
    }

    pub fn filetree_data_dir(&self) -> Result<PathBuf> {
        match &self.filetree.data_dir {
            Some(dir) => Ok(expand_home(dir)),
            None => Ok(get_app_dir()?.join("mutagen")),
        }
    }
}

pub fn load_config() -> Result<Option<Config>> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path)?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))?;
    Ok(Some(config))
}

pub fn save_config(config: &Config) -> Result<()> {
    let path = config_path()?;
    let content = toml::to_string_pretty(config)?;
    fs::write(&path, content)?;
    Ok(())
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: f64,

    #[serde(default = "default_max_debounce_seconds")]
    pub max_debounce_seconds: f64,

    #[serde(default = "default_batch_size_threshold")]
    pub batch_size_threshold: usize,

    #[serde(default = "default_duplicate_event_window_seconds")]
    pub duplicate_event_window_seconds: f64,

    #[serde(default = "default_debounce_cache_max_items")]
    pub debounce_cache_max_items: usize,

    /// Relative sub-paths never synced, resolved against every root
    #[serde(default = "default_excluded_subpaths")]
    pub excluded_subpaths: Vec<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_thread_join_timeout_seconds")]
    pub thread_join_timeout_seconds: u64,

    #[serde(default = "default_final_batch_timeout_seconds")]
    pub final_batch_timeout_seconds: u64,

    #[serde(default = "default_root_health_check_seconds")]
    pub root_health_check_seconds: u64,
}

fn default_debounce_seconds() -> f64 {
    0.25
}

fn default_max_debounce_seconds() -> f64 {
    2.0
}

fn default_batch_size_threshold() -> usize {
    512
}

fn default_duplicate_event_window_seconds() -> f64 {
    1.0
}

fn default_debounce_cache_max_items() -> usize {
    1024
}

fn default_excluded_subpaths() -> Vec<PathBuf> {
    DEFAULT_EXCLUDED_SUBPATHS.iter().map(PathBuf::from).collect()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_thread_join_timeout_seconds() -> u64 {
    5
}

fn default_final_batch_timeout_seconds() -> u64 {
    15
}

fn default_root_health_check_seconds() -> u64 {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            max_debounce_seconds: default_max_debounce_seconds(),
            batch_size_threshold: default_batch_size_threshold(),
            duplicate_event_window_seconds: default_duplicate_event_window_seconds(),
            debounce_cache_max_items: default_debounce_cache_max_items(),
            excluded_subpaths: default_excluded_subpaths(),
            poll_interval_ms: default_poll_interval_ms(),
            thread_join_timeout_seconds: default_thread_join_timeout_seconds(),
            final_batch_timeout_seconds: default_final_batch_timeout_seconds(),
            root_health_check_seconds: default_root_health_check_seconds(),
        }
    }
}

/// Negative or non-finite values fall back to zero
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl SyncConfig {
    pub fn thread_join_timeout(&self) -> Duration {
        Duration::from_secs(self.thread_join_timeout_seconds)
    }

    pub fn final_batch_timeout(&self) -> Duration {
        Duration::from_secs(self.final_batch_timeout_seconds)
    }

    pub fn observer_timings(&self) -> ObserverTimings {
        ObserverTimings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            root_health_check_interval: Duration::from_secs(self.root_health_check_seconds),
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        let debounce = seconds(config.debounce_seconds);
        SchedulerConfig {
            debounce,
            max_debounce: seconds(config.max_debounce_seconds).max(debounce),
            batch_size_threshold: config.batch_size_threshold.max(1),
            duplicate_event_window: seconds(config.duplicate_event_window_seconds),
            debounce_cache_max_items: config.debounce_cache_max_items.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
}

fn default_git_command_timeout_seconds() -> u64 {
    30
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: default_git_command_timeout_seconds(),
        }
    }
}

impl GitConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    #[default]
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub runtime: SandboxRuntime,

    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Prints one changed path per line. Defaults to a recursive
    /// `inotifywait -m` on the workspace.
    #[serde(default)]
    pub remote_watch_command: Option<Vec<String>>,

    /// Run the watch command as root, so a workspace owned by root is
    /// still readable by the watcher
    #[serde(default = "default_watch_as_root")]
    pub watch_as_root: bool,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_watch_as_root() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: SandboxRuntime::default(),
            workspace_dir: default_workspace_dir(),
            remote_watch_command: None,
            watch_as_root: default_watch_as_root(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiletreeTool {
    #[default]
    Mutagen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiletreeConfig {
    #[serde(default)]
    pub tool: FiletreeTool,

    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,

    /// Daemon data directory. Defaults to `<app dir>/mutagen`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_session_prefix() -> String {
    crate::sync::filetree::DEFAULT_SESSION_PREFIX.to_string()
}

impl Default for FiletreeConfig {
    fn default() -> Self {
        Self {
            tool: FiletreeTool::default(),
            session_prefix: default_session_prefix(),
            data_dir: None,
        }
    }
}
