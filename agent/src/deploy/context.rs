//! Runtime context shared by every state of a run

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::artifact::{Artifact, ArtifactSource};
use crate::deploy::fsm::{DeploymentOutcome, DeploymentTracker};
use crate::deploy::reboot::SystemRebooter;
use crate::deploy::states::{Checkpoint, Event, Flavor, State};
use crate::errors::AgentError;
use crate::http::deployments::DeploymentApi;
use crate::storage::provides::{load_provides, PROVIDES_GROUP, PROVIDES_NAME};
use crate::storage::state_data::{LoadedStateData, StateData, StateDataStore};
use crate::update_module::file_tree::FileTreeInfo;
use crate::update_module::{ModuleRegistry, UpdateModule};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Tunables of the deployment states
#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    /// Extra rollback reboots tried when verifying the rollback fails
    pub rollback_reboot_retries: u32,

    /// Attempts at delivering the final deployment status
    pub final_status_retries: u32,

    /// Backoff between final status attempts
    pub final_status_cooldown: CooldownOptions,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            rollback_reboot_retries: 3,
            final_status_retries: 10,
            final_status_cooldown: CooldownOptions {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(300),
                repeats: 3,
            },
        }
    }
}

/// When the daemon next polls for deployments and submits inventory
#[derive(Debug, Clone)]
pub struct PollSchedule {
    update_interval: Duration,
    inventory_interval: Duration,
    retry: CooldownOptions,
    next_update: Instant,
    next_inventory: Instant,
    update_failures: u32,
    inventory_failures: u32,
}

impl PollSchedule {
    /// Both timers fire right away
    pub fn new(update_interval: Duration, inventory_interval: Duration, retry: CooldownOptions) -> Self {
        let now = Instant::now();
        Self {
            update_interval,
            inventory_interval,
            retry,
            next_update: now,
            next_inventory: now,
            update_failures: 0,
            inventory_failures: 0,
        }
    }

    /// The earliest deadline and the event it triggers; inventory wins ties
    pub fn next_trigger(&self) -> (Instant, Event) {
        if self.next_inventory <= self.next_update {
            (self.next_inventory, Event::InventoryPollingTriggered)
        } else {
            (self.next_update, Event::DeploymentPollingTriggered)
        }
    }

    pub fn update_polled(&mut self, ok: bool) {
        self.next_update = Self::reschedule(
            &mut self.update_failures,
            ok,
            self.update_interval,
            &self.retry,
        );
    }

    pub fn inventory_submitted(&mut self, ok: bool) {
        self.next_inventory = Self::reschedule(
            &mut self.inventory_failures,
            ok,
            self.inventory_interval,
            &self.retry,
        );
    }

    fn reschedule(failures: &mut u32, ok: bool, interval: Duration, retry: &CooldownOptions) -> Instant {
        let wait = if ok {
            *failures = 0;
            interval
        } else {
            *failures = failures.saturating_add(1);
            calc_exp_backoff(retry, *failures).min(interval)
        };
        Instant::now() + wait
    }
}

/// Daemon-only collaborators
pub struct DaemonServices {
    pub api: Arc<dyn DeploymentApi>,
    pub schedule: PollSchedule,

    /// Leave after the first deployment instead of going back to idle
    pub stop_after_deployment: bool,

    shutdown_rx: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl DaemonServices {
    pub fn new(
        api: Arc<dyn DeploymentApi>,
        schedule: PollSchedule,
        stop_after_deployment: bool,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            api,
            schedule,
            stop_after_deployment,
            shutdown_rx,
            shutdown_requested: false,
        }
    }

    /// Wait for the next poll deadline. `None` once shutdown was requested.
    pub async fn wait_for_trigger(&mut self) -> Option<Event> {
        if self.shutdown_requested {
            return None;
        }
        let (deadline, event) = self.schedule.next_trigger();
        tokio::select! {
            _ = self.shutdown_rx.recv() => {
                info!("Shutdown requested while idle");
                self.shutdown_requested = true;
                None
            }
            _ = tokio::time::sleep_until(deadline) => Some(event),
        }
    }
}

/// What happened during a run, for the standalone verbs to report on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub artifact_name: Option<String>,

    /// The device was touched: `ArtifactInstall` was at least attempted
    pub install_started: bool,

    /// `ArtifactInstall` succeeded in this run
    pub installed: bool,
    pub reboot_required: bool,
    pub committed: bool,
    pub rolled_back: bool,

    /// Stopped before committing because the update can still be rolled back
    pub waiting_for_commit: bool,

    /// Stopped because a rollback was asked for but is not supported
    pub rollback_unsupported: bool,

    /// Set when the deployment reached its end
    pub outcome: Option<DeploymentOutcome>,
    pub failed: bool,
}

/// Everything known about the deployment in progress
pub struct ActiveDeployment {
    pub state_data: StateData,
    pub artifact: Option<Box<dyn Artifact>>,
    pub module: Option<Arc<dyn UpdateModule>>,
    pub tree_info: Option<FileTreeInfo>,

    /// `ArtifactCommit` was entered; rolling back is no longer allowed
    pub commit_entered: bool,
}

impl ActiveDeployment {
    pub fn new(state_data: StateData) -> Self {
        Self {
            state_data,
            artifact: None,
            module: None,
            tree_info: None,
            commit_entered: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.state_data.update_info.id
    }
}

pub struct DeploymentContext {
    pub flavor: Flavor,
    pub store: StateDataStore,
    pub modules: Arc<dyn ModuleRegistry>,
    pub artifacts: Arc<dyn ArtifactSource>,
    pub rebooter: Arc<dyn SystemRebooter>,
    pub device_type: String,
    pub options: DeploymentOptions,
    pub daemon: Option<DaemonServices>,

    pub tracker: DeploymentTracker,
    pub deployment: Option<ActiveDeployment>,
    pub report: RunReport,
}

impl DeploymentContext {
    pub fn new(
        flavor: Flavor,
        store: StateDataStore,
        modules: Arc<dyn ModuleRegistry>,
        artifacts: Arc<dyn ArtifactSource>,
        rebooter: Arc<dyn SystemRebooter>,
        device_type: String,
        options: DeploymentOptions,
    ) -> Self {
        Self {
            flavor,
            store,
            modules,
            artifacts,
            rebooter,
            device_type,
            options,
            daemon: None,
            tracker: DeploymentTracker::new(),
            deployment: None,
            report: RunReport::default(),
        }
    }

    pub fn with_daemon(mut self, daemon: DaemonServices) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn deployment(&self) -> Result<&ActiveDeployment, AgentError> {
        self.deployment
            .as_ref()
            .ok_or_else(|| AgentError::Internal("No deployment in progress".to_string()))
    }

    pub fn deployment_mut(&mut self) -> Result<&mut ActiveDeployment, AgentError> {
        self.deployment
            .as_mut()
            .ok_or_else(|| AgentError::Internal("No deployment in progress".to_string()))
    }

    pub fn module(&self) -> Result<Arc<dyn UpdateModule>, AgentError> {
        self.deployment()?
            .module
            .clone()
            .ok_or_else(|| AgentError::Internal("No Update Module for this deployment".to_string()))
    }

    /// File tree contents for the module, rebuilt from state data after a restart
    pub async fn tree_info(&self) -> Result<FileTreeInfo, AgentError> {
        let deployment = self.deployment()?;
        if let Some(info) = &deployment.tree_info {
            return Ok(info.clone());
        }
        let provides = load_provides(self.store.database().as_ref()).await?;
        let current_name = provides.get(PROVIDES_NAME).map(String::as_str).unwrap_or("");
        let current_group = provides.get(PROVIDES_GROUP).map(String::as_str).unwrap_or("");
        Ok(FileTreeInfo::from_state_data(&deployment.state_data).with_current(
            current_name,
            current_group,
            &self.device_type,
        ))
    }

    /// Pick a persisted deployment back up.
    ///
    /// Returns the state to continue from. Work already confirmed by a
    /// checkpoint is never repeated.
    pub async fn resume(&mut self, loaded: LoadedStateData) -> Result<State, AgentError> {
        let LoadedStateData {
            data,
            loop_detected,
        } = loaded;
        let checkpoint = Checkpoint::parse(&data.state)?;
        let info = &data.update_info;
        info!(
            "Resuming deployment {} of {} at {}",
            info.id, info.artifact.artifact_name, data.state
        );

        let failed = info.deployment_failed;
        let (state, tracker) = match checkpoint {
            Checkpoint::Download => (
                State::RollbackNotNeeded,
                DeploymentTracker::restore(true, true, false),
            ),
            Checkpoint::ArtifactInstall => (State::ArtifactInstall, DeploymentTracker::restore(false, false, false)),
            Checkpoint::Installed => (State::CheckReboot, DeploymentTracker::restore(false, false, false)),
            Checkpoint::ArtifactReboot | Checkpoint::ArtifactVerifyReboot => (
                State::ArtifactVerifyReboot,
                DeploymentTracker::restore(false, false, false),
            ),
            Checkpoint::ArtifactCommit => (State::ArtifactCommit, DeploymentTracker::restore(false, false, false)),
            Checkpoint::AfterCommit => (State::AfterCommit, DeploymentTracker::restore(false, false, false)),
            Checkpoint::ArtifactRollback => (
                State::ArtifactRollback,
                DeploymentTracker::restore(failed, false, true),
            ),
            Checkpoint::ArtifactRollbackReboot | Checkpoint::ArtifactVerifyRollbackReboot => (
                State::ArtifactVerifyRollbackReboot,
                DeploymentTracker::restore(failed, false, true),
            ),
            Checkpoint::ArtifactFailure | Checkpoint::Cleanup => {
                let rollback_failed = failed && !info.all_rollbacks_successful;
                let state = if checkpoint == Checkpoint::Cleanup {
                    State::Cleanup
                } else {
                    State::ArtifactFailure
                };
                (state, DeploymentTracker::restore(failed, rollback_failed, false))
            }
        };

        let module = match info.artifact.payload_types.first() {
            Some(payload_type) => match self.modules.module_for(payload_type).await {
                Ok(module) => Some(module),
                Err(e) => {
                    error!("Cannot resume with the Update Module for {}: {}", payload_type, e);
                    None
                }
            },
            None => None,
        };

        self.report.artifact_name = Some(info.artifact.artifact_name.clone());
        self.report.install_started = checkpoint != Checkpoint::Download;
        self.tracker = tracker;
        self.deployment = Some(ActiveDeployment {
            module,
            commit_entered: checkpoint.in_commit_phase(),
            ..ActiveDeployment::new(data)
        });

        if loop_detected {
            warn!("State data was loaded too many times, giving up on the deployment");
            return Ok(State::StateLoop);
        }
        Ok(state)
    }
}
