//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the update agent
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Persistent data directory (datastore, device_type)
    pub data_dir: PathBuf,

    /// Directory holding one Update Module executable per payload type
    pub modules_dir: PathBuf,

    /// Scratch directory for Update Module File-Trees
    pub modules_work_dir: PathBuf,

    /// Configuration directory
    pub config_dir: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted entirely under one directory
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            data_dir: base_dir.join("data"),
            modules_dir: base_dir.join("modules"),
            modules_work_dir: base_dir.join("modules-work"),
            config_dir: base_dir.join("config"),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.config_dir.join("settings.json"))
    }

    /// Get the key-value datastore file
    pub fn datastore_file(&self) -> File {
        File::new(self.data_dir.join("datastore.json"))
    }

    /// Get the device_type file
    pub fn device_type_file(&self) -> File {
        File::new(self.data_dir.join("device_type"))
    }

    /// Get the Update Modules directory
    pub fn modules_dir(&self) -> Dir {
        Dir::new(&self.modules_dir)
    }

    /// Get the Update Modules work directory
    pub fn modules_work_dir(&self) -> Dir {
        Dir::new(&self.modules_work_dir)
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.data_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), AgentError> {
        Dir::new(&self.data_dir).create().await?;
        self.modules_work_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/otagent"),
            modules_dir: PathBuf::from("/usr/share/otagent/modules/v3"),
            modules_work_dir: PathBuf::from("/var/lib/otagent/modules/v3"),
            config_dir: PathBuf::from("/etc/otagent"),
        }
    }
}
