//! Fakes and a harness wiring them into a deployment context

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;

use otagent::artifact::{Artifact, ArtifactHeader, ArtifactSource, PayloadFile, PayloadHeader};
use otagent::deploy::context::{DaemonServices, PollSchedule};
use otagent::deploy::reboot::SystemRebooter;
use otagent::deploy::{DeploymentContext, DeploymentOptions, Flavor};
use otagent::errors::AgentError;
use otagent::http::deployments::{
    DeploymentApi, DeploymentArtifact, DeploymentInfo, DeploymentSource, DeploymentStatus,
};
use otagent::storage::database::{write_transaction, MemoryDatabase};
use otagent::storage::provides::{
    commit_artifact_data_in, load_provides, ArtifactData, ProvidesData,
};
use otagent::storage::state_data::StateDataStore;
use otagent::update_module::file_tree::FileTreeInfo;
use otagent::update_module::{
    ModuleCall, ModuleRegistry, RebootAction, RollbackSupport, UpdateModule,
};
use otagent::utils::CooldownOptions;

pub const DEVICE_TYPE: &str = "qemux86-64";
pub const PAYLOAD_TYPE: &str = "rootfs-image";
pub const OLD_ARTIFACT: &str = "release-1";
pub const NEW_ARTIFACT: &str = "release-2";
pub const NEW_ARTIFACT_URI: &str = "file:///artifacts/release-2";

// ============================== UPDATE MODULE ================================ //

/// Update Module recording every call it gets
pub struct FakeModule {
    calls: Mutex<Vec<ModuleCall>>,
    downloaded: Mutex<Vec<(String, Vec<u8>)>>,
    failing: Mutex<HashMap<ModuleCall, u32>>,
    hang_on: Option<ModuleCall>,
    malformed_queries: bool,
    reboot: RebootAction,
    rollback: RollbackSupport,
}

impl FakeModule {
    pub fn new(reboot: RebootAction, rollback: RollbackSupport) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            downloaded: Mutex::new(Vec::new()),
            failing: Mutex::new(HashMap::new()),
            hang_on: None,
            malformed_queries: false,
            reboot,
            rollback,
        }
    }

    /// Fail every time `call` is made
    pub fn failing(self, call: ModuleCall) -> Self {
        self.failing_times(call, u32::MAX)
    }

    pub fn failing_times(self, call: ModuleCall, times: u32) -> Self {
        self.failing.lock().unwrap().insert(call, times);
        self
    }

    /// Never return from `call`, as if the device lost power during it
    pub fn hanging_on(mut self, call: ModuleCall) -> Self {
        self.hang_on = Some(call);
        self
    }

    /// Answer queries with garbage
    pub fn with_malformed_queries(mut self) -> Self {
        self.malformed_queries = true;
        self
    }

    pub fn calls(&self) -> Vec<ModuleCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls without the queries
    pub fn state_calls(&self) -> Vec<ModuleCall> {
        self.calls().into_iter().filter(|c| !c.is_query()).collect()
    }

    pub fn count(&self, call: ModuleCall) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn downloaded(&self) -> Vec<(String, Vec<u8>)> {
        self.downloaded.lock().unwrap().clone()
    }

    async fn act(&self, call: ModuleCall) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push(call);
        if self.hang_on == Some(call) {
            std::future::pending::<()>().await;
        }

        let mut failing = self.failing.lock().unwrap();
        match failing.get_mut(&call) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AgentError::ModuleError(format!("{} exited with 1", call)))
            }
            _ => Ok(()),
        }
    }

    async fn answer<T>(&self, call: ModuleCall, value: T) -> Result<T, AgentError> {
        self.act(call).await?;
        if self.malformed_queries {
            return Err(AgentError::ProtocolError(format!(
                "Unexpected answer to {}: \"Maybe\"",
                call
            )));
        }
        Ok(value)
    }
}

#[async_trait]
impl UpdateModule for FakeModule {
    fn payload_type(&self) -> &str {
        PAYLOAD_TYPE
    }

    async fn prepare_file_tree(&self, _info: &FileTreeInfo) -> Result<(), AgentError> {
        Ok(())
    }

    async fn ensure_file_tree(&self, _info: &FileTreeInfo) -> Result<(), AgentError> {
        Ok(())
    }

    async fn download(&self, files: Vec<PayloadFile>) -> Result<(), AgentError> {
        for mut file in files {
            let mut body = Vec::new();
            file.reader.read_to_end(&mut body).await?;
            self.downloaded.lock().unwrap().push((file.name, body));
        }
        self.act(ModuleCall::Download).await
    }

    async fn call_state(&self, state: ModuleCall) -> Result<(), AgentError> {
        self.act(state).await
    }

    async fn needs_reboot(&self) -> Result<RebootAction, AgentError> {
        self.answer(ModuleCall::NeedsArtifactReboot, self.reboot).await
    }

    async fn supports_rollback(&self) -> Result<RollbackSupport, AgentError> {
        self.answer(ModuleCall::SupportsRollback, self.rollback).await
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        self.act(ModuleCall::Cleanup).await
    }
}

/// Serves one module for [`PAYLOAD_TYPE`]
pub struct FakeRegistry {
    module: Arc<FakeModule>,
}

#[async_trait]
impl ModuleRegistry for FakeRegistry {
    async fn module_for(&self, payload_type: &str) -> Result<Arc<dyn UpdateModule>, AgentError> {
        if payload_type != PAYLOAD_TYPE {
            return Err(AgentError::NoModuleForPayload(payload_type.to_string()));
        }
        Ok(self.module.clone())
    }
}

// ================================ ARTIFACTS ================================== //

#[derive(Clone)]
pub struct FakeArtifact {
    header: ArtifactHeader,
    files: Vec<(String, Vec<u8>)>,
}

impl FakeArtifact {
    /// A rootfs artifact for [`DEVICE_TYPE`]
    pub fn rootfs(name: &str) -> Self {
        let header = ArtifactHeader {
            artifact_name: name.to_string(),
            depends: BTreeMap::from([(
                "device_type".to_string(),
                vec![DEVICE_TYPE.to_string()],
            )]),
            provides: Some(ProvidesData::from([(
                "rootfs-image.checksum".to_string(),
                format!("sha-of-{}", name),
            )])),
            clears_provides: Some(vec!["rootfs-image.*".to_string()]),
            payloads: vec![PayloadHeader {
                payload_type: PAYLOAD_TYPE.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Self {
            header,
            files: vec![("rootfs.ext4".to_string(), b"new root filesystem".to_vec())],
        }
    }

    pub fn with_header(mut self, edit: impl FnOnce(&mut ArtifactHeader)) -> Self {
        edit(&mut self.header);
        self
    }
}

#[async_trait]
impl Artifact for FakeArtifact {
    fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    async fn payload_files(&mut self, index: usize) -> Result<Vec<PayloadFile>, AgentError> {
        if index != 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .files
            .iter()
            .map(|(name, body)| PayloadFile {
                name: name.clone(),
                reader: Box::new(std::io::Cursor::new(body.clone())),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeArtifactSource {
    artifacts: Mutex<HashMap<String, FakeArtifact>>,
}

impl FakeArtifactSource {
    pub fn add(&self, uri: &str, artifact: FakeArtifact) {
        self.artifacts.lock().unwrap().insert(uri.to_string(), artifact);
    }
}

#[async_trait]
impl ArtifactSource for FakeArtifactSource {
    async fn open(&self, uri: &str) -> Result<Box<dyn Artifact>, AgentError> {
        let artifact = self.artifacts.lock().unwrap().get(uri).cloned();
        match artifact {
            Some(artifact) => Ok(Box::new(artifact)),
            None => Err(AgentError::ArtifactError(format!("No artifact at {}", uri))),
        }
    }
}

/// Pretends the system went down and came back
#[derive(Default)]
pub struct FakeRebooter {
    reboots: AtomicU32,
}

impl FakeRebooter {
    pub fn reboots(&self) -> u32 {
        self.reboots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SystemRebooter for FakeRebooter {
    async fn reboot(&self) -> Result<(), AgentError> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================ DEPLOYMENT SERVER ============================== //

#[derive(Default)]
pub struct FakeApi {
    deployments: Mutex<VecDeque<DeploymentInfo>>,
    statuses: Mutex<Vec<(String, DeploymentStatus)>>,
    inventory: Mutex<Vec<BTreeMap<String, String>>>,
    polls: AtomicU32,
    failing_final_statuses: AtomicU32,
    final_status_attempts: AtomicU32,
}

impl FakeApi {
    pub fn with_deployment(id: &str, artifact_name: &str, uri: &str) -> Self {
        let api = Self::default();
        api.deployments.lock().unwrap().push_back(DeploymentInfo {
            id: id.to_string(),
            artifact: DeploymentArtifact {
                artifact_name: artifact_name.to_string(),
                source: DeploymentSource {
                    uri: uri.to_string(),
                    expire: String::new(),
                },
            },
        });
        api
    }

    /// Reject the next `count` success/failure reports
    pub fn fail_final_statuses(&self, count: u32) {
        self.failing_final_statuses.store(count, Ordering::SeqCst);
    }

    pub fn statuses(&self) -> Vec<DeploymentStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn inventory(&self) -> Vec<BTreeMap<String, String>> {
        self.inventory.lock().unwrap().clone()
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn final_status_attempts(&self) -> u32 {
        self.final_status_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentApi for FakeApi {
    async fn next_deployment(
        &self,
        _device_type: &str,
        _provides: &ProvidesData,
    ) -> Result<Option<DeploymentInfo>, AgentError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.deployments.lock().unwrap().pop_front())
    }

    async fn push_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), AgentError> {
        if matches!(status, DeploymentStatus::Success | DeploymentStatus::Failure) {
            self.final_status_attempts.fetch_add(1, Ordering::SeqCst);
            let rejected = self
                .failing_final_statuses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                return Err(AgentError::ApiError {
                    status: 503,
                    message: "Service Unavailable".to_string(),
                });
            }
        }
        self.statuses
            .lock()
            .unwrap()
            .push((deployment_id.to_string(), status));
        Ok(())
    }

    async fn submit_inventory(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        self.inventory.lock().unwrap().push(attributes.clone());
        Ok(())
    }
}

// ================================= HARNESS =================================== //

/// One device: a datastore, a module and the artifacts it can reach
pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub module: Arc<FakeModule>,
    pub artifacts: Arc<FakeArtifactSource>,
    pub rebooter: Arc<FakeRebooter>,
    pub max_store_count: u32,
    pub options: DeploymentOptions,
}

impl Harness {
    /// A device running [`OLD_ARTIFACT`] with [`NEW_ARTIFACT`] available
    pub async fn new(module: FakeModule) -> Self {
        let harness = Self {
            db: Arc::new(MemoryDatabase::new()),
            module: Arc::new(module),
            artifacts: Arc::new(FakeArtifactSource::default()),
            rebooter: Arc::new(FakeRebooter::default()),
            max_store_count: 28,
            options: DeploymentOptions {
                rollback_reboot_retries: 2,
                final_status_retries: 3,
                final_status_cooldown: CooldownOptions {
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(10),
                    repeats: 3,
                },
            },
        };
        harness.artifacts.add(NEW_ARTIFACT_URI, FakeArtifact::rootfs(NEW_ARTIFACT));
        harness.seed_installed(OLD_ARTIFACT).await;
        harness
    }

    /// The same device after a restart, now with `module` installed
    pub fn restarted(&self, module: FakeModule) -> Self {
        Self {
            db: self.db.clone(),
            module: Arc::new(module),
            artifacts: self.artifacts.clone(),
            rebooter: self.rebooter.clone(),
            max_store_count: self.max_store_count,
            options: self.options.clone(),
        }
    }

    pub fn store(&self) -> StateDataStore {
        StateDataStore::new(self.db.clone(), self.max_store_count)
    }

    pub fn context(&self, flavor: Flavor) -> DeploymentContext {
        DeploymentContext::new(
            flavor,
            self.store(),
            Arc::new(FakeRegistry {
                module: self.module.clone(),
            }),
            self.artifacts.clone(),
            self.rebooter.clone(),
            DEVICE_TYPE.to_string(),
            self.options.clone(),
        )
    }

    /// Daemon context polling right away; keep the sender alive to avoid a
    /// shutdown
    pub fn daemon_context(
        &self,
        api: Arc<FakeApi>,
        stop_after_deployment: bool,
    ) -> (DeploymentContext, broadcast::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let schedule = PollSchedule::new(
            Duration::from_secs(1800),
            Duration::from_secs(7200),
            CooldownOptions {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(1800),
                repeats: 3,
            },
        );
        let services = DaemonServices::new(api, schedule, stop_after_deployment, shutdown_rx);
        (self.context(Flavor::Daemon).with_daemon(services), shutdown_tx)
    }

    pub async fn seed_installed(&self, name: &str) {
        let provides = ProvidesData::from([(
            "rootfs-image.checksum".to_string(),
            format!("sha-of-{}", name),
        )]);
        write_transaction(self.db.as_ref(), |txn| {
            commit_artifact_data_in(
                txn,
                &ArtifactData {
                    artifact_name: name,
                    artifact_group: "",
                    provides: Some(&provides),
                    clears_provides: None,
                },
            )
        })
        .await
        .unwrap();
    }

    pub async fn provides(&self) -> ProvidesData {
        load_provides(self.db.as_ref()).await.unwrap()
    }

    pub async fn artifact_name(&self) -> String {
        self.provides()
            .await
            .get("artifact_name")
            .cloned()
            .unwrap_or_default()
    }

    pub async fn update_in_progress(&self) -> bool {
        self.store().exists().await.unwrap()
    }
}
