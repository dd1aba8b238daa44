//! What each state does when entered

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::deploy::context::{ActiveDeployment, DeploymentContext};
use crate::deploy::fsm::{transition, DeploymentOutcome};
use crate::deploy::orchestrator::{EventQueue, StateMachine};
use crate::deploy::states::{Event, Flavor, State};
use crate::errors::AgentError;
use crate::http::deployments::{DeploymentApi, DeploymentStatus};
use crate::storage::database::write_transaction;
use crate::storage::provides::{
    add_inconsistent_suffix, check_depends, commit_artifact_data_in, load_provides, ArtifactData,
    DEPENDS_DEVICE_TYPE, PROVIDES_GROUP, PROVIDES_NAME,
};
use crate::storage::state_data::{ArtifactInfo, ArtifactSource, StateData, UpdateInfo};
use crate::update_module::file_tree::FileTreeInfo;
use crate::update_module::{ModuleCall, RebootAction, RollbackSupport};
use crate::utils::{calc_exp_backoff, version_info};

/// The deployment state machine: transition table plus state actions
pub struct DeploymentMachine {
    ctx: DeploymentContext,
}

impl DeploymentMachine {
    pub fn new(ctx: DeploymentContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &DeploymentContext {
        &self.ctx
    }

    pub fn into_context(self) -> DeploymentContext {
        self.ctx
    }

    fn daemon_api(&self) -> Option<Arc<dyn DeploymentApi>> {
        self.ctx.daemon.as_ref().map(|daemon| daemon.api.clone())
    }

    /// Best-effort progress report, daemon only
    async fn push_status(&self, status: DeploymentStatus) {
        let (Some(api), Some(deployment)) = (self.daemon_api(), self.ctx.deployment.as_ref())
        else {
            return;
        };
        if let Err(e) = api.push_status(deployment.id(), status).await {
            warn!("Could not report deployment status {}: {}", status, e);
        }
    }

    async fn call_module(&self, call: ModuleCall) -> Result<(), AgentError> {
        let module = self.ctx.module()?;
        let info = self.ctx.tree_info().await?;
        module.ensure_file_tree(&info).await?;
        module.call_state(call).await
    }

    fn update_info(&mut self) -> Result<&mut UpdateInfo, AgentError> {
        Ok(&mut self.ctx.deployment_mut()?.state_data.update_info)
    }

    async fn rollback_support(&mut self) -> Result<RollbackSupport, AgentError> {
        if let Some(support) = self.ctx.deployment()?.state_data.update_info.supports_rollback {
            return Ok(support);
        }
        let support = match self.ctx.module()?.supports_rollback().await {
            Ok(support) => support,
            Err(e @ AgentError::ProtocolError(_)) => {
                warn!("{}, assuming rollback is not supported", e);
                RollbackSupport::No
            }
            Err(e) => return Err(e),
        };
        debug!("Rollback support: {:?}", support);
        self.update_info()?.supports_rollback = Some(support);
        Ok(support)
    }

    async fn reboot_action(&mut self) -> Result<RebootAction, AgentError> {
        if let Some(action) = self.ctx.deployment()?.state_data.update_info.reboot_action() {
            return Ok(action);
        }
        let action = match self.ctx.module()?.needs_reboot().await {
            Ok(action) => action,
            Err(e @ AgentError::ProtocolError(_)) => {
                warn!("{}, assuming no reboot is needed", e);
                RebootAction::No
            }
            Err(e) => return Err(e),
        };
        debug!("Reboot action: {:?}", action);
        self.update_info()?.reboot_requested = vec![action];
        Ok(action)
    }

    fn outcome(&self) -> DeploymentOutcome {
        let rolled_back = self
            .ctx
            .deployment
            .as_ref()
            .map(|d| d.state_data.update_info.all_rollbacks_successful)
            .unwrap_or(false);
        self.ctx.tracker.outcome(rolled_back)
    }

    // ============================== DAEMON IDLING ================================ //

    async fn idle(&mut self, events: &mut EventQueue) {
        let Some(daemon) = self.ctx.daemon.as_mut() else {
            error!("Idle entered without daemon services");
            return;
        };
        if let Some(event) = daemon.wait_for_trigger().await {
            events.post(event);
        }
    }

    async fn submit_inventory(&mut self) -> Event {
        let result = self.try_submit_inventory().await;
        if let Some(daemon) = self.ctx.daemon.as_mut() {
            daemon.schedule.inventory_submitted(result.is_ok());
        }
        match result {
            Ok(()) => Event::Success,
            Err(e) => {
                warn!("Inventory submission failed: {}", e);
                Event::Failure
            }
        }
    }

    async fn try_submit_inventory(&self) -> Result<(), AgentError> {
        let api = self
            .daemon_api()
            .ok_or_else(|| AgentError::Internal("No deployment server".to_string()))?;
        let mut attributes: BTreeMap<String, String> =
            load_provides(self.ctx.store.database().as_ref()).await?;
        attributes.insert(DEPENDS_DEVICE_TYPE.to_string(), self.ctx.device_type.clone());
        attributes.insert("client_version".to_string(), version_info().version);
        api.submit_inventory(&attributes).await?;
        info!("Inventory submitted");
        Ok(())
    }

    async fn poll_for_deployment(&mut self) -> Event {
        let result = self.try_poll_for_deployment().await;
        if let Some(daemon) = self.ctx.daemon.as_mut() {
            daemon.schedule.update_polled(result.is_ok());
        }
        match result {
            Ok(true) => Event::Success,
            Ok(false) => Event::NothingToDo,
            Err(e) => {
                warn!("Polling for deployments failed: {}", e);
                Event::Failure
            }
        }
    }

    async fn try_poll_for_deployment(&mut self) -> Result<bool, AgentError> {
        let api = self
            .daemon_api()
            .ok_or_else(|| AgentError::Internal("No deployment server".to_string()))?;
        let provides = load_provides(self.ctx.store.database().as_ref()).await?;

        let Some(info) = api.next_deployment(&self.ctx.device_type, &provides).await? else {
            debug!("No deployment available");
            return Ok(false);
        };

        let current = provides.get(PROVIDES_NAME).map(String::as_str).unwrap_or("");
        if !info.artifact.artifact_name.is_empty() && info.artifact.artifact_name == current {
            info!(
                "Artifact {} of deployment {} is already installed",
                current, info.id
            );
            if let Err(e) = api
                .push_status(&info.id, DeploymentStatus::AlreadyInstalled)
                .await
            {
                warn!("Could not report deployment status: {}", e);
            }
            return Ok(false);
        }

        info!("New deployment {}: {}", info.id, info.artifact.artifact_name);
        let update_info = UpdateInfo {
            id: info.id,
            artifact: ArtifactInfo {
                source: ArtifactSource {
                    uri: info.artifact.source.uri,
                    expire: info.artifact.source.expire,
                },
                artifact_name: info.artifact.artifact_name,
                ..Default::default()
            },
            ..Default::default()
        };
        self.ctx.deployment = Some(ActiveDeployment::new(StateData::new(update_info)));
        Ok(true)
    }

    // ============================== UPDATE PATH ================================== //

    /// Open the artifact and decide whether it can be installed here.
    /// Returns false for an artifact without payload.
    async fn fetch_artifact(&mut self) -> Result<bool, AgentError> {
        let uri = self.ctx.deployment()?.state_data.update_info.artifact.source.uri.clone();
        let artifact = self.ctx.artifacts.open(&uri).await?;
        let header = artifact.header().clone();
        self.ctx.report.artifact_name = Some(header.artifact_name.clone());

        if header.payloads.len() > 1 {
            return Err(AgentError::Unsupported(format!(
                "Artifact {} has {} payloads, only one is supported",
                header.artifact_name,
                header.payloads.len()
            )));
        }

        let provides = load_provides(self.ctx.store.database().as_ref()).await?;
        check_depends(&header.depends, &provides, &self.ctx.device_type)?;

        let module = match header.payloads.first() {
            Some(payload) => Some(self.ctx.modules.module_for(&payload.payload_type).await?),
            None => None,
        };

        let current_name = provides.get(PROVIDES_NAME).map(String::as_str).unwrap_or("");
        let current_group = provides
            .get(PROVIDES_GROUP)
            .map(String::as_str)
            .unwrap_or("");
        let tree_info = FileTreeInfo::from_header(&header, 0).with_current(
            current_name,
            current_group,
            &self.ctx.device_type,
        );

        let deployment = self.ctx.deployment_mut()?;
        let artifact_info = &mut deployment.state_data.update_info.artifact;
        artifact_info.artifact_name = header.artifact_name.clone();
        artifact_info.artifact_group = header.artifact_group.clone();
        artifact_info.payload_types = header.payload_types();
        artifact_info.device_types_compatible = header.device_types_compatible();
        artifact_info.artifact_provides = header.provides.clone();
        artifact_info.clears_artifact_provides = header.clears_provides.clone();

        deployment.artifact = Some(artifact);
        deployment.module = module;
        deployment.tree_info = Some(tree_info);

        info!("Artifact {} accepted", header.artifact_name);
        Ok(!header.is_empty_payload())
    }

    async fn download(&mut self) -> Result<(), AgentError> {
        self.push_status(DeploymentStatus::Downloading).await;
        let module = self.ctx.module()?;
        let info = self.ctx.tree_info().await?;
        module.prepare_file_tree(&info).await?;

        let artifact = self
            .ctx
            .deployment_mut()?
            .artifact
            .as_mut()
            .ok_or_else(|| AgentError::Internal("Artifact is not open".to_string()))?;
        let files = artifact.payload_files(0).await?;
        module.download(files).await?;

        // Cached before the install checkpoint so a resumed install never asks again
        self.rollback_support().await?;
        Ok(())
    }

    async fn artifact_install(&mut self) -> Result<(), AgentError> {
        self.push_status(DeploymentStatus::Installing).await;
        self.ctx.report.install_started = true;
        self.call_module(ModuleCall::ArtifactInstall).await?;
        self.ctx.report.installed = true;
        Ok(())
    }

    async fn check_reboot(&mut self) -> Event {
        match self.reboot_action().await {
            Ok(action) if action.requires_reboot() => {
                self.ctx.report.reboot_required = true;
                Event::Success
            }
            Ok(_) => Event::NothingToDo,
            Err(e) => {
                error!("Could not determine whether a reboot is needed: {}", e);
                Event::Failure
            }
        }
    }

    async fn query_rollback_support(&mut self) -> Event {
        match self.rollback_support().await {
            Ok(support) if support.is_supported() => {
                info!("Update installed, waiting for commit");
                self.ctx.report.waiting_for_commit = true;
                Event::NeedsInteraction
            }
            Ok(_) => {
                info!("Update cannot be rolled back, committing right away");
                Event::Success
            }
            Err(e) => {
                error!("Could not determine rollback support: {}", e);
                Event::Failure
            }
        }
    }

    async fn artifact_reboot(&mut self) -> Result<(), AgentError> {
        self.push_status(DeploymentStatus::Rebooting).await;
        match self.reboot_action().await? {
            RebootAction::Yes => self.call_module(ModuleCall::ArtifactReboot).await,
            RebootAction::Automatic => self.ctx.rebooter.reboot().await,
            RebootAction::No => Ok(()),
        }
    }

    async fn artifact_commit(&mut self) -> Result<(), AgentError> {
        self.ctx.deployment_mut()?.commit_entered = true;
        self.call_module(ModuleCall::ArtifactCommit).await?;
        self.ctx.report.committed = true;
        Ok(())
    }

    /// Persist state data under the current schema once the commit is done
    async fn after_commit(&mut self) -> Result<(), AgentError> {
        let flavor = self.ctx.flavor;
        let deployment = self.ctx.deployment_mut()?;
        if !deployment.state_data.update_info.has_db_schema_update {
            return Ok(());
        }
        deployment.state_data.update_info.has_db_schema_update = false;
        let mut data = deployment.state_data.clone();
        match flavor {
            Flavor::Standalone => self.ctx.store.save_standalone(&mut data).await?,
            Flavor::Daemon => self.ctx.store.save(&mut data).await?,
        }
        self.ctx.deployment_mut()?.state_data = data;
        Ok(())
    }

    // ============================= ROLLBACK PATH ================================= //

    async fn check_rollback(&mut self, events: &mut EventQueue) {
        match self.ctx.deployment() {
            Ok(deployment) if deployment.commit_entered => {
                warn!("Commit already attempted, refusing to roll back");
                events.post(Event::NothingToDo);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("{}", e);
                events.post(Event::Failure);
                return;
            }
        }

        match self.rollback_support().await {
            Ok(support) if support.is_supported() => {
                info!("Rolling back");
                events.post(Event::RollbackStarted);
                events.post(Event::Success);
            }
            Ok(_) if self.ctx.flavor == Flavor::Standalone && !self.ctx.tracker.failed() => {
                error!("Rollback is not supported by this update");
                self.ctx.report.rollback_unsupported = true;
                events.post(Event::NeedsInteraction);
            }
            Ok(_) => {
                warn!("Rollback is not supported, the update has failed");
                events.post(Event::NothingToDo);
            }
            Err(e) => {
                error!("Could not determine rollback support: {}", e);
                events.post(Event::Failure);
            }
        }
    }

    async fn check_rollback_reboot(&mut self) -> Event {
        let reboot = match self.reboot_action().await {
            Ok(action) => action.requires_reboot(),
            Err(e) => {
                warn!("{}, rebooting after the rollback anyway", e);
                true
            }
        };
        if !reboot {
            return Event::NothingToDo;
        }
        // Counted before the rollback-reboot checkpoint so the count survives the reboot
        if let Ok(info) = self.update_info() {
            info.rollback_reboot_attempts = 1;
        }
        Event::Success
    }

    async fn artifact_rollback_reboot(&mut self) {
        let action = self
            .ctx
            .deployment()
            .ok()
            .and_then(|d| d.state_data.update_info.reboot_action());
        let result = match action {
            Some(RebootAction::Automatic) => self.ctx.rebooter.reboot().await,
            _ => self.call_module(ModuleCall::ArtifactRollbackReboot).await,
        };
        if let Err(e) = result {
            warn!("Rollback reboot did not happen, verifying anyway: {}", e);
        }
    }

    async fn artifact_verify_rollback_reboot(&mut self) -> Event {
        match self.call_module(ModuleCall::ArtifactVerifyRollbackReboot).await {
            Ok(()) => Event::Success,
            Err(e) => {
                let retries = self.ctx.options.rollback_reboot_retries;
                let info = match self.update_info() {
                    Ok(info) => info,
                    Err(err) => {
                        error!("{}", err);
                        return Event::Failure;
                    }
                };
                let attempts = info.rollback_reboot_attempts;
                if attempts <= retries {
                    warn!(
                        "Rollback reboot verification failed (attempt {}), rebooting again: {}",
                        attempts, e
                    );
                    info.rollback_reboot_attempts = attempts + 1;
                    Event::Retry
                } else {
                    error!("Rollback reboot verification failed: {}", e);
                    Event::Failure
                }
            }
        }
    }

    fn rollback_successful(&mut self) -> Event {
        if let Ok(info) = self.update_info() {
            info.all_rollbacks_successful = true;
        }
        self.ctx.report.rolled_back = true;
        info!("Rollback successful");
        if self.ctx.tracker.failed() {
            Event::Success
        } else {
            Event::NothingToDo
        }
    }

    async fn artifact_failure(&mut self) -> Result<(), AgentError> {
        if self.ctx.deployment()?.module.is_none() {
            warn!("No Update Module to run ArtifactFailure with");
            return Ok(());
        }
        self.call_module(ModuleCall::ArtifactFailure).await
    }

    // ============================== BOOKKEEPING ================================== //

    /// Commit the artifact identity the deployment leaves behind, together
    /// with the `cleanup` checkpoint
    async fn save_provides(&mut self) -> Result<(), AgentError> {
        let outcome = self.outcome();
        if outcome == DeploymentOutcome::RolledBack {
            info!("Previous artifact restored, keeping its identity");
            return Ok(());
        }

        let store = self.ctx.store.clone();
        let mut data = self.ctx.deployment()?.state_data.clone();
        data.state = State::Cleanup.checkpoint_name().unwrap_or("cleanup").to_string();
        store.count_checkpoint(&mut data)?;

        let artifact = data.update_info.artifact.clone();
        let name = match outcome {
            DeploymentOutcome::Inconsistent => add_inconsistent_suffix(&artifact.artifact_name),
            _ => artifact.artifact_name.clone(),
        };
        let clears_nothing: Vec<String> = Vec::new();
        let artifact_data = match outcome {
            DeploymentOutcome::Inconsistent => ArtifactData {
                artifact_name: &name,
                artifact_group: &artifact.artifact_group,
                provides: None,
                clears_provides: Some(&clears_nothing),
            },
            _ => ArtifactData {
                artifact_name: &name,
                artifact_group: &artifact.artifact_group,
                provides: artifact.artifact_provides.as_ref(),
                clears_provides: artifact.clears_artifact_provides.as_deref(),
            },
        };

        let db = store.database().clone();
        write_transaction(db.as_ref(), |txn| {
            store.stage(txn, &data)?;
            commit_artifact_data_in(txn, &artifact_data)
        })
        .await?;

        info!("Committed artifact identity {}", name);
        self.ctx.deployment_mut()?.state_data = data;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), AgentError> {
        match self.ctx.deployment()?.module.clone() {
            Some(module) => module.cleanup().await,
            None => Ok(()),
        }
    }

    /// Give up: the device is left marked inconsistent without further module calls
    async fn state_loop(&mut self) {
        let Ok(deployment) = self.ctx.deployment() else {
            return;
        };
        let artifact = &deployment.state_data.update_info.artifact;
        let name = add_inconsistent_suffix(&artifact.artifact_name);
        let group = artifact.artifact_group.clone();
        error!("Deployment is looping, marking the device as {}", name);

        let clears_nothing: Vec<String> = Vec::new();
        let result = write_transaction(self.ctx.store.database().as_ref(), |txn| {
            commit_artifact_data_in(
                txn,
                &ArtifactData {
                    artifact_name: &name,
                    artifact_group: &group,
                    provides: None,
                    clears_provides: Some(&clears_nothing),
                },
            )
        })
        .await;
        if let Err(e) = result {
            error!("Could not mark the artifact as inconsistent: {}", e);
        }
    }

    async fn send_final_status(&mut self) {
        let (Some(api), Ok(deployment)) = (self.daemon_api(), self.ctx.deployment()) else {
            return;
        };
        let id = deployment.id().to_string();
        let status = match self.outcome() {
            DeploymentOutcome::Success => DeploymentStatus::Success,
            _ => DeploymentStatus::Failure,
        };

        let retries = self.ctx.options.final_status_retries;
        let mut attempt = 0;
        loop {
            match api.push_status(&id, status).await {
                Ok(()) => {
                    info!("Reported deployment {} as {}", id, status);
                    return;
                }
                Err(e) if attempt >= retries => {
                    error!("Giving up reporting deployment {} as {}: {}", id, status, e);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    let wait = calc_exp_backoff(&self.ctx.options.final_status_cooldown, attempt);
                    warn!("Reporting final status failed, retrying in {:?}: {}", wait, e);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn clear_artifact_data(&mut self) -> Result<(), AgentError> {
        self.ctx.store.remove().await
    }

    fn end_of_deployment(&mut self, events: &mut EventQueue) {
        let outcome = self.outcome();
        self.ctx.report.outcome = Some(outcome);
        self.ctx.report.failed = self.ctx.tracker.failed();
        if let Some(deployment) = self.ctx.deployment.take() {
            info!(
                "Deployment {} of {} finished: {:?}",
                deployment.id(),
                deployment.state_data.update_info.artifact.artifact_name,
                outcome
            );
        }
        events.post(Event::DeploymentEnded);

        let stop = self
            .ctx
            .daemon
            .as_ref()
            .map(|daemon| daemon.stop_after_deployment)
            .unwrap_or(false);
        events.post(if stop { Event::NothingToDo } else { Event::Success });
    }
}

fn result_event(state: State, result: Result<(), AgentError>) -> Event {
    match result {
        Ok(()) => Event::Success,
        Err(e) => {
            error!("{:?} failed: {}", state, e);
            Event::Failure
        }
    }
}

#[async_trait]
impl StateMachine for DeploymentMachine {
    type State = State;

    fn transition(&self, state: State, event: Event) -> Result<State, AgentError> {
        transition(self.ctx.flavor, state, event)
    }

    fn checkpoint_name(&self, state: State) -> Option<&'static str> {
        state.checkpoint_name()
    }

    fn is_failure_path(&self, state: State) -> bool {
        state.is_failure_path()
    }

    fn observe(&mut self, event: Event) {
        self.ctx.tracker.observe(event);
    }

    async fn save_checkpoint(&mut self, state: State, name: &'static str) -> Result<(), AgentError> {
        let failed = self.ctx.tracker.failed();
        let flavor = self.ctx.flavor;
        let store = self.ctx.store.clone();
        let deployment = self.ctx.deployment_mut()?;
        let data = &mut deployment.state_data;
        data.state = name.to_string();
        data.update_info.deployment_failed = failed;
        debug!("Checkpoint {} for {:?}", name, state);
        match flavor {
            Flavor::Standalone => store.save_standalone(data).await,
            Flavor::Daemon => store.save(data).await,
        }
    }

    async fn on_enter(&mut self, state: State, events: &mut EventQueue) {
        let event = match state {
            State::Init => Event::Started,
            State::Idle => return self.idle(events).await,
            State::SubmitInventory => self.submit_inventory().await,
            State::PollForDeployment => self.poll_for_deployment().await,
            State::FetchArtifact => {
                events.post(Event::DeploymentStarted);
                match self.fetch_artifact().await {
                    Ok(true) => Event::Success,
                    Ok(false) => Event::NothingToDo,
                    Err(e) => {
                        error!("Cannot deploy the artifact: {}", e);
                        Event::Failure
                    }
                }
            }
            State::Download => {
                let result = self.download().await;
                result_event(state, result)
            }
            State::RollbackNotNeeded => {
                if let Ok(info) = self.update_info() {
                    info.all_rollbacks_successful = true;
                }
                info!("Nothing was installed, no rollback needed");
                events.post(Event::RollbackStarted);
                Event::Success
            }
            State::ArtifactInstall => {
                let result = self.artifact_install().await;
                result_event(state, result)
            }
            State::CheckReboot => self.check_reboot().await,
            State::QueryRollbackSupport => self.query_rollback_support().await,
            State::ArtifactReboot => {
                let result = self.artifact_reboot().await;
                result_event(state, result)
            }
            State::ArtifactVerifyReboot => {
                let result = self.call_module(ModuleCall::ArtifactVerifyReboot).await;
                result_event(state, result)
            }
            State::ArtifactCommit => {
                let result = self.artifact_commit().await;
                result_event(state, result)
            }
            State::AfterCommit => {
                let result = self.after_commit().await;
                result_event(state, result)
            }
            State::CheckRollback => return self.check_rollback(events).await,
            State::ArtifactRollback => {
                let result = self.call_module(ModuleCall::ArtifactRollback).await;
                result_event(state, result)
            }
            State::CheckRollbackReboot => self.check_rollback_reboot().await,
            State::ArtifactRollbackReboot => {
                self.artifact_rollback_reboot().await;
                Event::Success
            }
            State::ArtifactVerifyRollbackReboot => self.artifact_verify_rollback_reboot().await,
            State::RollbackSuccessful => self.rollback_successful(),
            State::ArtifactFailure => {
                let result = self.artifact_failure().await;
                result_event(state, result)
            }
            State::SaveProvides => match self.save_provides().await {
                Ok(()) => Event::Success,
                Err(e) if e.is_state_loop() => {
                    error!("{}", e);
                    Event::StateLoopDetected
                }
                Err(e) => {
                    error!("Could not save the artifact identity: {}", e);
                    Event::Failure
                }
            },
            State::Cleanup => {
                let result = self.cleanup().await;
                result_event(state, result)
            }
            State::StateLoop => {
                self.state_loop().await;
                Event::Failure
            }
            State::SendFinalStatus => {
                self.send_final_status().await;
                Event::Success
            }
            State::ClearArtifactData => {
                let result = self.clear_artifact_data().await;
                result_event(state, result)
            }
            State::EndOfDeployment => return self.end_of_deployment(events),
            State::Exit => return,
        };
        events.post(event);
    }
}
