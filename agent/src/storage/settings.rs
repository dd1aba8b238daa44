//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Write a rolling log file in the data directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Deployment server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// How often to ask the server for a new deployment
    #[serde(default = "default_update_poll_interval")]
    pub update_poll_interval_secs: u64,

    /// How often to submit inventory
    #[serde(default = "default_inventory_poll_interval")]
    pub inventory_poll_interval_secs: u64,

    /// First retry delay after a failed poll or status push
    #[serde(default = "default_retry_poll_interval")]
    pub retry_poll_interval_secs: u64,

    /// Maximum attempts for the final status push
    #[serde(default = "default_retry_poll_count")]
    pub retry_poll_count: u32,

    /// Hard limit for a single Update Module invocation
    #[serde(default = "default_module_timeout")]
    pub module_timeout_secs: u64,

    /// Delay between SIGTERM and SIGKILL when a module times out
    #[serde(default = "default_module_kill_grace")]
    pub module_kill_grace_secs: u64,

    /// Number of checkpoints allowed per deployment before a state loop is assumed
    #[serde(default = "default_max_state_data_store_count")]
    pub max_state_data_store_count: u32,

    /// How many times a failed rollback reboot verification re-enters the rollback reboot
    #[serde(default = "default_rollback_reboot_retries")]
    pub rollback_reboot_retries: u32,

    /// Command used for reboots the agent performs itself
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,

    /// How long to wait for a requested reboot to take the process down
    #[serde(default = "default_reboot_wait")]
    pub reboot_wait_secs: u64,

    /// Overrides for the storage layout
    #[serde(default)]
    pub paths: PathSettings,
}

fn default_update_poll_interval() -> u64 {
    1800
}

fn default_inventory_poll_interval() -> u64 {
    28800
}

fn default_retry_poll_interval() -> u64 {
    300
}

fn default_retry_poll_count() -> u32 {
    10
}

fn default_module_timeout() -> u64 {
    4 * 60 * 60
}

fn default_module_kill_grace() -> u64 {
    60
}

fn default_max_state_data_store_count() -> u32 {
    28
}

fn default_rollback_reboot_retries() -> u32 {
    3
}

fn default_reboot_command() -> Vec<String> {
    vec!["reboot".to_string()]
}

fn default_reboot_wait() -> u64 {
    600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            server: ServerSettings::default(),
            update_poll_interval_secs: default_update_poll_interval(),
            inventory_poll_interval_secs: default_inventory_poll_interval(),
            retry_poll_interval_secs: default_retry_poll_interval(),
            retry_poll_count: default_retry_poll_count(),
            module_timeout_secs: default_module_timeout(),
            module_kill_grace_secs: default_module_kill_grace(),
            max_state_data_store_count: default_max_state_data_store_count(),
            rollback_reboot_retries: default_rollback_reboot_retries(),
            reboot_command: default_reboot_command(),
            reboot_wait_secs: default_reboot_wait(),
            paths: PathSettings::default(),
        }
    }
}

/// Deployment server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the deployment server
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Bearer token presented to the server
    #[serde(default)]
    pub token: Option<String>,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            token: None,
        }
    }
}

/// Optional path overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub modules_dir: Option<PathBuf>,

    #[serde(default)]
    pub modules_work_dir: Option<PathBuf>,
}

/// Load settings from file. A missing file yields the defaults.
pub async fn load_settings(settings_file: &File) -> Result<Settings, AgentError> {
    if !settings_file.exists().await {
        return Ok(Settings::default());
    }

    settings_file.read_json().await.map_err(|e| {
        AgentError::ConfigError(format!(
            "Invalid settings file {}: {}",
            settings_file.path().display(),
            e
        ))
    })
}
