//! Wiring of the collaborators and the two ways of running a deployment

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::app::options::AppOptions;
use crate::artifact::unpacked::UnpackedArtifactSource;
use crate::deploy::context::{DaemonServices, PollSchedule};
use crate::deploy::reboot::CommandRebooter;
use crate::deploy::standalone::{self, StandaloneResult};
use crate::deploy::{daemon, DeploymentContext, Flavor, RunReport};
use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::http::deployments::HttpDeploymentApi;
use crate::storage::database::FileDatabase;
use crate::storage::device::load_device_type;
use crate::storage::state_data::StateDataStore;
use crate::update_module::ExecutableModuleRegistry;

/// A standalone command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandaloneCommand {
    Install(String),
    Commit,
    Rollback,
    Resume,
}

async fn init_context(options: &AppOptions, flavor: Flavor) -> Result<DeploymentContext, AgentError> {
    options.layout.setup().await?;

    let device_type = load_device_type(&options.layout.device_type_file()).await?;
    debug!("Device type: {}", device_type);

    let db = FileDatabase::open(options.layout.datastore_file()).await?;
    let store = StateDataStore::new(Arc::new(db), options.max_state_data_store_count);

    let modules = ExecutableModuleRegistry::new(
        &options.layout.modules_dir,
        &options.layout.modules_work_dir,
        options.module.clone(),
    );
    let rebooter = CommandRebooter::new(options.reboot.command.clone(), options.reboot.wait);

    Ok(DeploymentContext::new(
        flavor,
        store,
        Arc::new(modules),
        Arc::new(UnpackedArtifactSource),
        Arc::new(rebooter),
        device_type,
        options.deployment.clone(),
    ))
}

/// Run one standalone command to completion
pub async fn run_standalone(
    options: &AppOptions,
    command: StandaloneCommand,
) -> Result<StandaloneResult, AgentError> {
    let ctx = init_context(options, Flavor::Standalone).await?;
    match command {
        StandaloneCommand::Install(uri) => standalone::install(ctx, &uri).await,
        StandaloneCommand::Commit => standalone::commit(ctx).await,
        StandaloneCommand::Rollback => standalone::rollback(ctx).await,
        StandaloneCommand::Resume => standalone::resume(ctx).await,
    }
}

/// Run the daemon until `shutdown_signal` resolves.
///
/// A deployment in progress when the signal arrives runs to its end first.
pub async fn run_daemon(
    options: &AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<RunReport, AgentError> {
    info!("Initializing update daemon...");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let client = HttpClient::new(&options.server_url, options.server_token.clone())?;
    let schedule = PollSchedule::new(
        options.daemon.update_poll_interval,
        options.daemon.inventory_poll_interval,
        options.daemon.retry.clone(),
    );
    let services = DaemonServices::new(
        Arc::new(HttpDeploymentApi::new(client)),
        schedule,
        options.daemon.stop_after_deployment,
        shutdown_rx,
    );
    let ctx = init_context(options, Flavor::Daemon).await?.with_daemon(services);

    let signal_handle = tokio::spawn(async move {
        shutdown_signal.await;
        info!("Shutdown signal received, stopping after the current state...");
        let _ = shutdown_tx.send(());
    });

    let result = daemon::run(ctx).await;
    signal_handle.abort();
    info!("Shutdown complete");
    result
}
