//! Deployment server API

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::storage::provides::{ProvidesData, DEPENDS_DEVICE_TYPE};

const NEXT_DEPLOYMENT_PATH: &str = "/api/devices/v2/deployments/device/deployments/next";
const INVENTORY_PATH: &str = "/api/devices/v1/inventory/device/attributes";

/// A deployment assigned to this device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeploymentInfo {
    pub id: String,
    pub artifact: DeploymentArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeploymentArtifact {
    #[serde(default)]
    pub artifact_name: String,
    pub source: DeploymentSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeploymentSource {
    pub uri: String,
    #[serde(default)]
    pub expire: String,
}

/// Deployment status as reported to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::AlreadyInstalled => "already-installed",
        };
        f.write_str(name)
    }
}

/// Server side of a daemon deployment
#[async_trait]
pub trait DeploymentApi: Send + Sync {
    /// Ask for a deployment matching the device; `None` when there is none
    async fn next_deployment(
        &self,
        device_type: &str,
        provides: &ProvidesData,
    ) -> Result<Option<DeploymentInfo>, AgentError>;

    async fn push_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), AgentError>;

    async fn submit_inventory(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), AgentError>;
}

#[derive(Serialize)]
struct NextDeploymentRequest<'a> {
    device_provides: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct StatusRequest {
    status: DeploymentStatus,
}

#[derive(Serialize)]
struct InventoryAttribute<'a> {
    name: &'a str,
    value: &'a str,
}

/// [`DeploymentApi`] over HTTP
pub struct HttpDeploymentApi {
    client: HttpClient,
}

impl HttpDeploymentApi {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

fn next_deployment_request<'a>(
    device_type: &'a str,
    provides: &'a ProvidesData,
) -> NextDeploymentRequest<'a> {
    let mut device_provides: BTreeMap<&str, &str> = provides
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    device_provides.insert(DEPENDS_DEVICE_TYPE, device_type);
    NextDeploymentRequest { device_provides }
}

#[async_trait]
impl DeploymentApi for HttpDeploymentApi {
    async fn next_deployment(
        &self,
        device_type: &str,
        provides: &ProvidesData,
    ) -> Result<Option<DeploymentInfo>, AgentError> {
        let request = next_deployment_request(device_type, provides);
        self.client.post(NEXT_DEPLOYMENT_PATH, &request).await
    }

    async fn push_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), AgentError> {
        let path = format!(
            "/api/devices/v1/deployments/device/deployments/{}/status",
            deployment_id
        );
        self.client.put(&path, &StatusRequest { status }).await
    }

    async fn submit_inventory(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let body: Vec<InventoryAttribute> = attributes
            .iter()
            .map(|(name, value)| InventoryAttribute { name, value })
            .collect();
        self.client.put(INVENTORY_PATH, &body).await
    }
}
