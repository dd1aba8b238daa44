//! Whole-system reboots requested with `reboot-type-automatic`

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::AgentError;

/// Reboots the device on behalf of the deployment
#[async_trait]
pub trait SystemRebooter: Send + Sync {
    /// Only returns if the reboot did not happen
    async fn reboot(&self) -> Result<(), AgentError>;
}

/// Runs a configured command and waits for the system to go down
pub struct CommandRebooter {
    command: Vec<String>,
    wait: Duration,
}

impl CommandRebooter {
    pub fn new(command: Vec<String>, wait: Duration) -> Self {
        Self { command, wait }
    }
}

#[async_trait]
impl SystemRebooter for CommandRebooter {
    async fn reboot(&self) -> Result<(), AgentError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AgentError::ConfigError("Reboot command is empty".to_string()))?;

        info!("Rebooting the system: {}", self.command.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .await?;

        if !status.success() {
            return Err(AgentError::ModuleError(format!(
                "Reboot command exited with {}",
                status
            )));
        }

        debug!("Waiting {:?} for the reboot to take effect", self.wait);
        tokio::time::sleep(self.wait).await;
        Err(AgentError::Internal(format!(
            "System did not reboot within {:?}",
            self.wait
        )))
    }
}
