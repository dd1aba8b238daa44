//! Long-running mode: poll the server, deploy, repeat

use tracing::{error, info};

use crate::deploy::catalog::DeploymentMachine;
use crate::deploy::context::{DeploymentContext, RunReport};
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::states::State;
use crate::errors::AgentError;

/// Run until shutdown, or until the first deployment ends when asked to
/// stop after it. An interrupted deployment is resumed first.
pub async fn run(mut ctx: DeploymentContext) -> Result<RunReport, AgentError> {
    if ctx.daemon.is_none() {
        return Err(AgentError::Internal(
            "Daemon started without a deployment server".to_string(),
        ));
    }

    if let Some(marker) = ctx.store.standalone_marker().await? {
        error!(
            "Standalone installation of {} started at {} is in progress",
            marker.artifact_name, marker.started_at
        );
        return Err(AgentError::UpdateInProgress(format!(
            "standalone installation of {} must be finished with commit, rollback or resume",
            marker.artifact_name
        )));
    }

    let start = match ctx.store.load().await? {
        Some(loaded) => ctx.resume(loaded).await?,
        None => State::Init,
    };

    info!("Daemon starting in {:?}", start);
    let mut orchestrator = Orchestrator::new(DeploymentMachine::new(ctx));
    let last = orchestrator.run(start).await?;
    info!("Daemon stopped in {:?}", last);

    Ok(orchestrator.into_machine().into_context().report)
}
