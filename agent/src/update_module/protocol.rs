//! Update Module protocol vocabulary: state names, queries and their answers

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// A state action or query an Update Module is invoked with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleCall {
    Download,
    ArtifactInstall,
    ArtifactReboot,
    ArtifactVerifyReboot,
    ArtifactCommit,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactFailure,
    Cleanup,
    NeedsArtifactReboot,
    SupportsRollback,
}

impl ModuleCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleCall::Download => "Download",
            ModuleCall::ArtifactInstall => "ArtifactInstall",
            ModuleCall::ArtifactReboot => "ArtifactReboot",
            ModuleCall::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            ModuleCall::ArtifactCommit => "ArtifactCommit",
            ModuleCall::ArtifactRollback => "ArtifactRollback",
            ModuleCall::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            ModuleCall::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            ModuleCall::ArtifactFailure => "ArtifactFailure",
            ModuleCall::Cleanup => "Cleanup",
            ModuleCall::NeedsArtifactReboot => "NeedsArtifactReboot",
            ModuleCall::SupportsRollback => "SupportsRollback",
        }
    }

    /// Queries answer on stdout; state actions only report through the exit code
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            ModuleCall::NeedsArtifactReboot | ModuleCall::SupportsRollback
        )
    }
}

impl fmt::Display for ModuleCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to `NeedsArtifactReboot`, persisted as its database string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootAction {
    #[default]
    #[serde(rename = "")]
    No,
    #[serde(rename = "reboot-type-custom")]
    Yes,
    #[serde(rename = "reboot-type-automatic")]
    Automatic,
}

impl RebootAction {
    pub fn requires_reboot(&self) -> bool {
        !matches!(self, RebootAction::No)
    }
}

/// Answer to `SupportsRollback`, persisted as its database string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackSupport {
    #[serde(rename = "rollback-not-supported")]
    No,
    #[serde(rename = "rollback-supported")]
    Yes,
    #[serde(rename = "rollback-automatic-dual-rootfs")]
    AutomaticDualRootfs,
}

impl RollbackSupport {
    pub fn is_supported(&self) -> bool {
        !matches!(self, RollbackSupport::No)
    }
}

/// Reduce query output to its single answer line.
///
/// No output is the same as an empty answer. More than one non-empty line
/// is a protocol violation.
fn answer_line(call: ModuleCall, output: &str) -> Result<String, AgentError> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().unwrap_or_default().to_string();
    if lines.next().is_some() {
        return Err(AgentError::ProtocolError(format!(
            "Too many lines in answer to {}: {:?}",
            call, output
        )));
    }
    Ok(first)
}

/// Parse the stdout of a `NeedsArtifactReboot` query
pub fn parse_needs_reboot(output: &str) -> Result<RebootAction, AgentError> {
    let answer = answer_line(ModuleCall::NeedsArtifactReboot, output)?;
    match answer.as_str() {
        "" | "No" => Ok(RebootAction::No),
        "Yes" => Ok(RebootAction::Yes),
        "Automatic" => Ok(RebootAction::Automatic),
        other => Err(AgentError::ProtocolError(format!(
            "Unexpected answer to NeedsArtifactReboot: {:?}",
            other
        ))),
    }
}

/// Parse the stdout of a `SupportsRollback` query
pub fn parse_supports_rollback(output: &str) -> Result<RollbackSupport, AgentError> {
    let answer = answer_line(ModuleCall::SupportsRollback, output)?;
    match answer.as_str() {
        "" | "No" => Ok(RollbackSupport::No),
        "Yes" => Ok(RollbackSupport::Yes),
        "AutomaticDualRootfs" => Ok(RollbackSupport::AutomaticDualRootfs),
        other => Err(AgentError::ProtocolError(format!(
            "Unexpected answer to SupportsRollback: {:?}",
            other
        ))),
    }
}
