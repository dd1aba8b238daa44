//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::DeploymentOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::update_module::call::ModuleOptions;
use crate::utils::CooldownOptions;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Deployment server base URL
    pub server_url: String,

    /// Bearer token for the deployment server
    pub server_token: Option<String>,

    /// Update Module execution limits
    pub module: ModuleOptions,

    /// Deployment state tunables
    pub deployment: DeploymentOptions,

    /// Checkpoints allowed per deployment before it is declared looping
    pub max_state_data_store_count: u32,

    pub daemon: DaemonOptions,
    pub reboot: RebootOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

impl AppOptions {
    /// Build the options from the settings file, applying its path overrides
    /// on top of `layout`
    pub fn from_settings(settings: &Settings, mut layout: StorageLayout) -> Self {
        if let Some(data_dir) = &settings.paths.data_dir {
            layout.data_dir = data_dir.clone();
        }
        if let Some(modules_dir) = &settings.paths.modules_dir {
            layout.modules_dir = modules_dir.clone();
        }
        if let Some(modules_work_dir) = &settings.paths.modules_work_dir {
            layout.modules_work_dir = modules_work_dir.clone();
        }

        let update_poll_interval = Duration::from_secs(settings.update_poll_interval_secs);
        let retry = CooldownOptions {
            base_delay: Duration::from_secs(settings.retry_poll_interval_secs),
            max_delay: update_poll_interval,
            repeats: 3,
        };

        Self {
            layout,
            server_url: settings.server.url.clone(),
            server_token: settings.server.token.clone(),
            module: ModuleOptions {
                timeout: Duration::from_secs(settings.module_timeout_secs),
                kill_grace: Duration::from_secs(settings.module_kill_grace_secs),
            },
            deployment: DeploymentOptions {
                rollback_reboot_retries: settings.rollback_reboot_retries,
                final_status_retries: settings.retry_poll_count,
                final_status_cooldown: retry.clone(),
            },
            max_state_data_store_count: settings.max_state_data_store_count,
            daemon: DaemonOptions {
                update_poll_interval,
                inventory_poll_interval: Duration::from_secs(settings.inventory_poll_interval_secs),
                retry,
                stop_after_deployment: false,
            },
            reboot: RebootOptions {
                command: settings.reboot_command.clone(),
                wait: Duration::from_secs(settings.reboot_wait_secs),
            },
        }
    }
}

/// Daemon polling options
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub update_poll_interval: Duration,
    pub inventory_poll_interval: Duration,

    /// Backoff after a failed poll or inventory submission
    pub retry: CooldownOptions,

    /// Exit once the first deployment ends
    pub stop_after_deployment: bool,
}

#[derive(Debug, Clone)]
pub struct RebootOptions {
    pub command: Vec<String>,
    pub wait: Duration,
}

/// Where the settings file is looked up when none is given
pub fn default_settings_path() -> PathBuf {
    StorageLayout::default().settings_file().path().to_path_buf()
}
