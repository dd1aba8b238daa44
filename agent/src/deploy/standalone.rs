//! One-shot `install`, `commit`, `rollback` and `resume` commands

use tracing::{debug, info};

use crate::deploy::catalog::DeploymentMachine;
use crate::deploy::context::{ActiveDeployment, DeploymentContext, RunReport};
use crate::deploy::fsm::DeploymentOutcome;
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::states::{Checkpoint, State};
use crate::errors::AgentError;
use crate::storage::state_data::{ArtifactInfo, ArtifactSource, StateData, UpdateInfo};
use crate::utils::generate_uuid;

/// How a standalone command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandaloneResult {
    /// Installed and waiting for `commit` or `rollback`
    Installed { reboot_required: bool },
    /// Installed and committed in one go, the update cannot be rolled back
    InstalledAndCommitted { reboot_required: bool },
    Committed,
    RolledBack,
    /// A rollback was requested but the update does not support it
    NoRollback,
    Failed { rolled_back: bool },
    /// The update failed before anything on the device changed
    FailedNothingDone,
    NoUpdateInProgress,
}

impl StandaloneResult {
    pub fn from_report(report: &RunReport) -> Self {
        if report.waiting_for_commit {
            return StandaloneResult::Installed {
                reboot_required: report.reboot_required,
            };
        }
        if report.rollback_unsupported {
            return StandaloneResult::NoRollback;
        }

        match report.outcome {
            Some(DeploymentOutcome::Success) if report.installed || !report.committed => {
                StandaloneResult::InstalledAndCommitted {
                    reboot_required: report.reboot_required,
                }
            }
            Some(DeploymentOutcome::Success) => StandaloneResult::Committed,
            Some(DeploymentOutcome::RolledBack) if !report.failed => StandaloneResult::RolledBack,
            Some(_) if !report.install_started => StandaloneResult::FailedNothingDone,
            Some(outcome) => StandaloneResult::Failed {
                rolled_back: outcome == DeploymentOutcome::RolledBack,
            },
            None => StandaloneResult::FailedNothingDone,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StandaloneResult::Installed { .. }
                | StandaloneResult::InstalledAndCommitted { .. }
                | StandaloneResult::Committed
                | StandaloneResult::RolledBack
        )
    }

    /// Process exit code. 4 signals a required reboot when asked for.
    pub fn exit_code(&self, reboot_exit_code: bool) -> i32 {
        match self {
            StandaloneResult::Installed {
                reboot_required: true,
            }
            | StandaloneResult::InstalledAndCommitted {
                reboot_required: true,
            } if reboot_exit_code => 4,
            StandaloneResult::NoUpdateInProgress => 2,
            result if result.is_success() => 0,
            _ => 1,
        }
    }
}

async fn run_from(ctx: DeploymentContext, start: State) -> Result<StandaloneResult, AgentError> {
    let mut orchestrator = Orchestrator::new(DeploymentMachine::new(ctx));
    let last = orchestrator.run(start).await?;
    debug!("Standalone run stopped in {:?}", last);

    let ctx = orchestrator.into_machine().into_context();
    let result = StandaloneResult::from_report(&ctx.report);
    info!("Standalone result: {:?}", result);
    Ok(result)
}

/// Install the artifact at `uri`, stopping before the commit if the update
/// can be rolled back
pub async fn install(mut ctx: DeploymentContext, uri: &str) -> Result<StandaloneResult, AgentError> {
    if ctx.store.exists().await? {
        return Err(AgentError::UpdateInProgress(
            "Finish it with commit, rollback or resume first".to_string(),
        ));
    }

    info!("Installing {}", uri);
    let update_info = UpdateInfo {
        id: generate_uuid(),
        artifact: ArtifactInfo {
            source: ArtifactSource {
                uri: uri.to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    ctx.deployment = Some(ActiveDeployment::new(StateData::new(update_info)));
    run_from(ctx, State::FetchArtifact).await
}

pub async fn commit(mut ctx: DeploymentContext) -> Result<StandaloneResult, AgentError> {
    let Some(loaded) = ctx.store.load().await? else {
        return Ok(StandaloneResult::NoUpdateInProgress);
    };

    let start = match Checkpoint::parse(&loaded.data.state)? {
        Checkpoint::Installed | Checkpoint::ArtifactCommit => State::ArtifactCommit,
        Checkpoint::AfterCommit => State::AfterCommit,
        _ => {
            return Err(AgentError::ValidationError(format!(
                "Cannot commit from state {}, use resume",
                loaded.data.state
            )));
        }
    };

    let resumed = ctx.resume(loaded).await?;
    let start = if resumed == State::StateLoop { resumed } else { start };
    run_from(ctx, start).await
}

pub async fn rollback(mut ctx: DeploymentContext) -> Result<StandaloneResult, AgentError> {
    let Some(loaded) = ctx.store.load().await? else {
        return Ok(StandaloneResult::NoUpdateInProgress);
    };

    let checkpoint = Checkpoint::parse(&loaded.data.state)?;
    if checkpoint.in_commit_phase() {
        return Err(AgentError::ValidationError(format!(
            "Commit already in progress ({}), use resume",
            loaded.data.state
        )));
    }

    let resumed = ctx.resume(loaded).await?;
    let start = if resumed == State::StateLoop
        || checkpoint == Checkpoint::Download
        || checkpoint.in_rollback_or_failure_path()
    {
        resumed
    } else {
        State::CheckRollback
    };
    run_from(ctx, start).await
}

/// Continue an interrupted deployment from its last checkpoint
pub async fn resume(mut ctx: DeploymentContext) -> Result<StandaloneResult, AgentError> {
    let Some(loaded) = ctx.store.load().await? else {
        return Ok(StandaloneResult::NoUpdateInProgress);
    };
    let start = ctx.resume(loaded).await?;
    run_from(ctx, start).await
}
