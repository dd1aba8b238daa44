//! State catalog vocabulary

use std::fmt;

use crate::errors::AgentError;

/// Every state of the deployment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init,
    Idle,
    SubmitInventory,
    PollForDeployment,
    FetchArtifact,
    Download,
    RollbackNotNeeded,
    ArtifactInstall,
    CheckReboot,
    QueryRollbackSupport,
    ArtifactReboot,
    ArtifactVerifyReboot,
    ArtifactCommit,
    AfterCommit,
    CheckRollback,
    ArtifactRollback,
    CheckRollbackReboot,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    RollbackSuccessful,
    ArtifactFailure,
    SaveProvides,
    Cleanup,
    StateLoop,
    SendFinalStatus,
    ClearArtifactData,
    EndOfDeployment,
    Exit,
}

impl State {
    pub const ALL: [State; 28] = [
        State::Init,
        State::Idle,
        State::SubmitInventory,
        State::PollForDeployment,
        State::FetchArtifact,
        State::Download,
        State::RollbackNotNeeded,
        State::ArtifactInstall,
        State::CheckReboot,
        State::QueryRollbackSupport,
        State::ArtifactReboot,
        State::ArtifactVerifyReboot,
        State::ArtifactCommit,
        State::AfterCommit,
        State::CheckRollback,
        State::ArtifactRollback,
        State::CheckRollbackReboot,
        State::ArtifactRollbackReboot,
        State::ArtifactVerifyRollbackReboot,
        State::RollbackSuccessful,
        State::ArtifactFailure,
        State::SaveProvides,
        State::Cleanup,
        State::StateLoop,
        State::SendFinalStatus,
        State::ClearArtifactData,
        State::EndOfDeployment,
        State::Exit,
    ];

    /// Name written to the state data before the state runs, for states that
    /// are checkpoints
    pub fn checkpoint_name(&self) -> Option<&'static str> {
        match self {
            State::Download => Some("update-store"),
            State::ArtifactInstall => Some("update-install"),
            State::CheckReboot => Some("update-installed"),
            State::ArtifactReboot => Some("reboot"),
            State::ArtifactVerifyReboot => Some("after-reboot"),
            State::ArtifactCommit => Some("update-commit"),
            State::AfterCommit => Some("update-after-commit"),
            State::ArtifactRollback => Some("rollback"),
            State::ArtifactRollbackReboot => Some("rollback-reboot"),
            State::ArtifactVerifyRollbackReboot => Some("after-rollback-reboot"),
            State::ArtifactFailure => Some("update-error"),
            State::Cleanup => Some("cleanup"),
            _ => None,
        }
    }

    /// States that keep going when their checkpoint cannot be written
    pub fn is_failure_path(&self) -> bool {
        matches!(self, State::ArtifactFailure | State::Cleanup)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A persisted state name, resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Download,
    ArtifactInstall,
    Installed,
    ArtifactReboot,
    ArtifactVerifyReboot,
    ArtifactCommit,
    AfterCommit,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactFailure,
    Cleanup,
}

impl Checkpoint {
    pub fn parse(name: &str) -> Result<Self, AgentError> {
        match name {
            "update-store" => Ok(Checkpoint::Download),
            "update-install" => Ok(Checkpoint::ArtifactInstall),
            "update-installed" => Ok(Checkpoint::Installed),
            "reboot" => Ok(Checkpoint::ArtifactReboot),
            "after-reboot" => Ok(Checkpoint::ArtifactVerifyReboot),
            "update-commit" => Ok(Checkpoint::ArtifactCommit),
            "update-after-commit" | "update-after-first-commit" => Ok(Checkpoint::AfterCommit),
            "rollback" => Ok(Checkpoint::ArtifactRollback),
            "rollback-reboot" => Ok(Checkpoint::ArtifactRollbackReboot),
            "after-rollback-reboot" | "verify-rollback-reboot" => {
                Ok(Checkpoint::ArtifactVerifyRollbackReboot)
            }
            "update-error" => Ok(Checkpoint::ArtifactFailure),
            "cleanup" => Ok(Checkpoint::Cleanup),
            other => Err(AgentError::UnknownState(other.to_string())),
        }
    }

    /// Once `ArtifactCommit` has been entered the update can no longer be rolled back
    pub fn in_commit_phase(&self) -> bool {
        matches!(self, Checkpoint::ArtifactCommit | Checkpoint::AfterCommit)
    }

    pub fn in_rollback_or_failure_path(&self) -> bool {
        matches!(
            self,
            Checkpoint::ArtifactRollback
                | Checkpoint::ArtifactRollbackReboot
                | Checkpoint::ArtifactVerifyRollbackReboot
                | Checkpoint::ArtifactFailure
                | Checkpoint::Cleanup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Started,
    Success,
    Failure,
    NothingToDo,
    Retry,
    StateLoopDetected,
    /// Stop and wait for the user (standalone only)
    NeedsInteraction,
    DeploymentStarted,
    DeploymentEnded,
    RollbackStarted,
    DeploymentPollingTriggered,
    InventoryPollingTriggered,
}

impl Event {
    /// Signals only observed by deployment tracking, never transitions
    pub fn is_tracking_signal(&self) -> bool {
        matches!(
            self,
            Event::DeploymentStarted | Event::DeploymentEnded | Event::RollbackStarted
        )
    }
}

/// Which driver composes the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Standalone,
    Daemon,
}
