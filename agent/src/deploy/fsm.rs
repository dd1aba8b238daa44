//! Transition table of the deployment state machine, plus the deployment
//! tracking sub-machine that remembers whether anything failed

use crate::deploy::states::{Event, Flavor, State};
use crate::errors::AgentError;

/// Resolve the next state for `event` posted while in `state`
pub fn transition(flavor: Flavor, state: State, event: Event) -> Result<State, AgentError> {
    use Event as E;
    use State as S;

    let standalone = flavor == Flavor::Standalone;

    let next = match (state, event) {
        // Any checkpoint state can run out of its loop budget
        (s, E::StateLoopDetected) if s.checkpoint_name().is_some() => S::StateLoop,
        (S::SaveProvides, E::StateLoopDetected) => S::StateLoop,

        // Daemon idling
        (S::Init, E::Started) if !standalone => S::Idle,
        (S::Idle, E::DeploymentPollingTriggered) if !standalone => S::PollForDeployment,
        (S::Idle, E::InventoryPollingTriggered) if !standalone => S::SubmitInventory,
        (S::SubmitInventory, E::Success | E::Failure) if !standalone => S::Idle,
        (S::PollForDeployment, E::Success) if !standalone => S::FetchArtifact,
        (S::PollForDeployment, E::NothingToDo | E::Failure) if !standalone => S::Idle,

        // Fetching the artifact header, nothing is on disk yet
        (S::FetchArtifact, E::Success) => S::Download,
        (S::FetchArtifact, E::NothingToDo) => S::SaveProvides,
        (S::FetchArtifact, E::Failure) if standalone => S::EndOfDeployment,
        (S::FetchArtifact, E::Failure) => S::SendFinalStatus,

        (S::Download, E::Success) => S::ArtifactInstall,
        (S::Download, E::Failure) => S::RollbackNotNeeded,
        (S::RollbackNotNeeded, E::Success) => S::Cleanup,

        (S::ArtifactInstall, E::Success) => S::CheckReboot,
        (S::ArtifactInstall, E::Failure) => S::ArtifactFailure,

        (S::CheckReboot, E::Success | E::NothingToDo) if standalone => S::QueryRollbackSupport,
        (S::CheckReboot, E::Success) => S::ArtifactReboot,
        (S::CheckReboot, E::NothingToDo) => S::ArtifactCommit,
        (S::CheckReboot, E::Failure) => S::CheckRollback,

        (S::QueryRollbackSupport, E::Success) if standalone => S::ArtifactCommit,
        (S::QueryRollbackSupport, E::NeedsInteraction) if standalone => S::Exit,
        (S::QueryRollbackSupport, E::Failure) if standalone => S::ArtifactFailure,

        (S::ArtifactReboot, E::Success) => S::ArtifactVerifyReboot,
        (S::ArtifactReboot, E::Failure) => S::CheckRollback,
        (S::ArtifactVerifyReboot, E::Success) => S::ArtifactCommit,
        (S::ArtifactVerifyReboot, E::Failure) => S::CheckRollback,

        // No rollback once the commit has been attempted
        (S::ArtifactCommit, E::Success) => S::AfterCommit,
        (S::ArtifactCommit, E::Failure) => S::ArtifactFailure,
        (S::AfterCommit, E::Success | E::Failure) => S::SaveProvides,

        (S::CheckRollback, E::Success) => S::ArtifactRollback,
        (S::CheckRollback, E::NothingToDo | E::Failure) => S::ArtifactFailure,
        (S::CheckRollback, E::NeedsInteraction) if standalone => S::Exit,

        (S::ArtifactRollback, E::Success) if standalone => S::RollbackSuccessful,
        (S::ArtifactRollback, E::Success) => S::CheckRollbackReboot,
        (S::ArtifactRollback, E::Failure) => S::ArtifactFailure,

        (S::CheckRollbackReboot, E::Success) => S::ArtifactRollbackReboot,
        (S::CheckRollbackReboot, E::NothingToDo) => S::RollbackSuccessful,
        (S::ArtifactRollbackReboot, E::Success | E::Failure) => S::ArtifactVerifyRollbackReboot,
        (S::ArtifactVerifyRollbackReboot, E::Success) => S::RollbackSuccessful,
        (S::ArtifactVerifyRollbackReboot, E::Retry) => S::ArtifactRollbackReboot,
        (S::ArtifactVerifyRollbackReboot, E::Failure) => S::ArtifactFailure,

        // A rollback following a failure still ends in ArtifactFailure
        (S::RollbackSuccessful, E::Success) => S::ArtifactFailure,
        (S::RollbackSuccessful, E::NothingToDo) => S::SaveProvides,

        (S::ArtifactFailure, E::Success | E::Failure) => S::SaveProvides,
        (S::SaveProvides, E::Success | E::Failure) => S::Cleanup,

        (S::Cleanup | S::StateLoop, E::Success | E::Failure) if standalone => S::ClearArtifactData,
        (S::Cleanup | S::StateLoop, E::Success | E::Failure) => S::SendFinalStatus,

        (S::SendFinalStatus, E::Success | E::Failure) if !standalone => S::ClearArtifactData,
        (S::ClearArtifactData, E::Success | E::Failure) => S::EndOfDeployment,

        (S::EndOfDeployment, E::Success) if standalone => S::Exit,
        (S::EndOfDeployment, E::Success) => S::SubmitInventory,
        (S::EndOfDeployment, E::NothingToDo) => S::Exit,

        (state, event) => {
            return Err(AgentError::Internal(format!(
                "No transition from {:?} on {:?} ({:?})",
                state, event, flavor
            )));
        }
    };

    Ok(next)
}

/// Deployment tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    Idle,
    NoFailures,
    Failure,
    RollbackAttempted,
    RollbackFailed,
}

/// How a deployment ends up, decided from the tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentOutcome {
    /// The new artifact is committed
    Success,
    /// The previous artifact is running again
    RolledBack,
    /// Neither artifact can be trusted
    Inconsistent,
}

/// Sub-machine fed with every event posted during a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentTracker {
    tracking: Tracking,
}

impl DeploymentTracker {
    pub fn new() -> Self {
        Self {
            tracking: Tracking::Idle,
        }
    }

    /// Rebuild the tracker from what was persisted
    pub fn restore(failed: bool, rollback_failed: bool, rollback_attempted: bool) -> Self {
        let tracking = match (failed, rollback_failed, rollback_attempted) {
            (false, _, _) => Tracking::NoFailures,
            (true, true, true) => Tracking::RollbackFailed,
            (true, true, false) => Tracking::Failure,
            (true, false, _) => Tracking::RollbackAttempted,
        };
        Self { tracking }
    }

    pub fn tracking(&self) -> Tracking {
        self.tracking
    }

    pub fn observe(&mut self, event: Event) {
        self.tracking = match (self.tracking, event) {
            (_, Event::DeploymentStarted) => Tracking::NoFailures,
            (_, Event::DeploymentEnded) => Tracking::Idle,
            (Tracking::NoFailures, Event::Failure) => Tracking::Failure,
            (Tracking::Failure, Event::RollbackStarted) => Tracking::RollbackAttempted,
            (Tracking::RollbackAttempted, Event::Failure) => Tracking::RollbackFailed,
            (tracking, _) => tracking,
        };
    }

    /// Whether anything failed during this deployment
    pub fn failed(&self) -> bool {
        matches!(
            self.tracking,
            Tracking::Failure | Tracking::RollbackAttempted | Tracking::RollbackFailed
        )
    }

    /// A failure with no successful rollback behind it
    pub fn rollback_failed(&self) -> bool {
        matches!(self.tracking, Tracking::Failure | Tracking::RollbackFailed)
    }

    /// `all_rollbacks_successful` covers rollbacks the user asked for
    pub fn outcome(&self, all_rollbacks_successful: bool) -> DeploymentOutcome {
        if self.rollback_failed() {
            DeploymentOutcome::Inconsistent
        } else if self.failed() || all_rollbacks_successful {
            DeploymentOutcome::RolledBack
        } else {
            DeploymentOutcome::Success
        }
    }
}

impl Default for DeploymentTracker {
    fn default() -> Self {
        Self::new()
    }
}
