//! Persisted record of the deployment in progress
//!
//! The record lives under the `state` key while a deployment runs and is
//! removed when it ends. Every save counts as one checkpoint; a deployment
//! that checkpoints more often than allowed is assumed to be looping.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::errors::AgentError;
use crate::storage::database::{KeyValueDatabase, Transaction};
use crate::update_module::protocol::{RebootAction, RollbackSupport};

pub const STATE_DATA_VERSION: i64 = 2;

pub const STATE_DATA_KEY: &str = "state";
pub const STATE_DATA_KEY_UNCOMMITTED: &str = "state-uncommitted";
pub const STANDALONE_STATE_KEY: &str = "standalone-state";

/// Payload type implied by records written before payload types were stored
const LEGACY_PAYLOAD_TYPE: &str = "rootfs-image";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSource {
    #[serde(rename = "URI", default)]
    pub uri: String,

    #[serde(rename = "Expire", default)]
    pub expire: String,
}

/// Identity and metadata of the artifact being deployed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    #[serde(rename = "Source", default)]
    pub source: ArtifactSource,

    #[serde(default)]
    pub device_types_compatible: Vec<String>,

    #[serde(rename = "PayloadTypes", default)]
    pub payload_types: Vec<String>,

    #[serde(default)]
    pub artifact_name: String,

    #[serde(default)]
    pub artifact_group: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_provides: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clears_artifact_provides: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    #[serde(rename = "Artifact", default)]
    pub artifact: ArtifactInfo,

    #[serde(rename = "ID", default)]
    pub id: String,

    /// One entry per payload once `NeedsArtifactReboot` has been answered
    #[serde(rename = "RebootRequested", default)]
    pub reboot_requested: Vec<RebootAction>,

    /// `None` until `SupportsRollback` has been answered
    #[serde(rename = "SupportsRollback", default, with = "rollback_support_string")]
    pub supports_rollback: Option<RollbackSupport>,

    #[serde(rename = "StateDataStoreCount", default)]
    pub state_data_store_count: u32,

    #[serde(rename = "HasDBSchemaUpdate", default)]
    pub has_db_schema_update: bool,

    #[serde(rename = "AllRollbacksSuccessful", default)]
    pub all_rollbacks_successful: bool,

    #[serde(rename = "DeploymentFailed", default)]
    pub deployment_failed: bool,

    /// Rollback reboots started so far, including the one in progress
    #[serde(rename = "RollbackRebootAttempts", default)]
    pub rollback_reboot_attempts: u32,
}

impl UpdateInfo {
    /// Reboot answer of the payload, `None` if not queried yet
    pub fn reboot_action(&self) -> Option<RebootAction> {
        self.reboot_requested.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    #[serde(rename = "Version")]
    pub version: i64,

    /// Persisted name of the last checkpointed state
    #[serde(rename = "Name", default)]
    pub state: String,

    #[serde(rename = "UpdateInfo", default)]
    pub update_info: UpdateInfo,
}

impl StateData {
    pub fn new(update_info: UpdateInfo) -> Self {
        Self {
            version: STATE_DATA_VERSION,
            state: String::new(),
            update_info,
        }
    }
}

mod rollback_support_string {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::RollbackSupport;

    pub fn serialize<S: Serializer>(
        value: &Option<RollbackSupport>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(support) => support.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<RollbackSupport>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        RollbackSupport::deserialize(serde::de::value::StrDeserializer::<D::Error>::new(&raw))
            .map(Some)
    }
}

/// Result of loading the stored record
#[derive(Debug, Clone)]
pub struct LoadedStateData {
    pub data: StateData,

    /// The checkpoint budget ran out; the deployment must not touch modules again
    pub loop_detected: bool,
}

/// Marker kept next to the record while a standalone deployment runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandaloneMarker {
    pub artifact_name: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Reads and writes [`StateData`] with checkpoint accounting
#[derive(Clone)]
pub struct StateDataStore {
    db: Arc<dyn KeyValueDatabase>,
    max_store_count: u32,
}

impl StateDataStore {
    pub fn new(db: Arc<dyn KeyValueDatabase>, max_store_count: u32) -> Self {
        Self {
            db,
            max_store_count,
        }
    }

    pub fn database(&self) -> &Arc<dyn KeyValueDatabase> {
        &self.db
    }

    pub fn max_store_count(&self) -> u32 {
        self.max_store_count
    }

    /// Count one checkpoint, failing once the budget is used up
    pub fn count_checkpoint(&self, data: &mut StateData) -> Result<(), AgentError> {
        let count = data.update_info.state_data_store_count;
        data.update_info.state_data_store_count = count.saturating_add(1);
        if count >= self.max_store_count {
            return Err(AgentError::StateLoopDetected(format!(
                "State data stored {} times, giving up on {}",
                count + 1,
                data.state
            )));
        }
        Ok(())
    }

    /// Stage the record in `txn` under the key its schema calls for
    pub fn stage(&self, txn: &mut Transaction, data: &StateData) -> Result<(), AgentError> {
        let mut data = data.clone();
        data.version = STATE_DATA_VERSION;
        let content = serde_json::to_vec(&data)?;
        trace!("Staging state data: {}", String::from_utf8_lossy(&content));

        if data.update_info.has_db_schema_update {
            // keep the old-schema record readable until the update is committed
            txn.write(STATE_DATA_KEY_UNCOMMITTED, &content);
        } else {
            txn.remove(STATE_DATA_KEY_UNCOMMITTED);
            txn.write(STATE_DATA_KEY, &content);
        }
        Ok(())
    }

    /// Checkpoint the record
    pub async fn save(&self, data: &mut StateData) -> Result<(), AgentError> {
        self.count_checkpoint(data)?;
        let mut txn = self.db.begin().await?;
        self.stage(&mut txn, data)?;
        self.db.commit(txn).await?;
        debug!(
            "Saved state data at {} (checkpoint {})",
            data.state, data.update_info.state_data_store_count
        );
        Ok(())
    }

    /// Checkpoint the record together with the standalone marker
    pub async fn save_standalone(&self, data: &mut StateData) -> Result<(), AgentError> {
        self.count_checkpoint(data)?;
        let marker = StandaloneMarker {
            artifact_name: data.update_info.artifact.artifact_name.clone(),
            started_at: chrono::Utc::now(),
        };
        let mut txn = self.db.begin().await?;
        if txn.read_optional(STANDALONE_STATE_KEY)?.is_none() {
            txn.write(STANDALONE_STATE_KEY, &serde_json::to_vec(&marker)?);
        }
        self.stage(&mut txn, data)?;
        self.db.commit(txn).await
    }

    /// Stage removal of everything describing the deployment in progress
    pub fn stage_remove(&self, txn: &mut Transaction) {
        txn.remove(STATE_DATA_KEY);
        txn.remove(STATE_DATA_KEY_UNCOMMITTED);
        txn.remove(STANDALONE_STATE_KEY);
    }

    pub async fn remove(&self) -> Result<(), AgentError> {
        let mut txn = self.db.begin().await?;
        self.stage_remove(&mut txn);
        self.db.commit(txn).await
    }

    /// Whether a deployment is in progress, without counting a checkpoint
    pub async fn exists(&self) -> Result<bool, AgentError> {
        let txn = self.db.begin().await?;
        Ok(txn.read_optional(STATE_DATA_KEY)?.is_some())
    }

    /// Whether a standalone deployment owns the record
    pub async fn standalone_marker(&self) -> Result<Option<StandaloneMarker>, AgentError> {
        let txn = self.db.begin().await?;
        match txn.read_optional(STANDALONE_STATE_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(|e| {
                AgentError::DatabaseValueError(format!("{}: {}", STANDALONE_STATE_KEY, e))
            })?)),
            None => Ok(None),
        }
    }

    /// Load the record of the deployment in progress, if any.
    ///
    /// Loading counts as a checkpoint so that a crash loop during startup is
    /// caught as well.
    pub async fn load(&self) -> Result<Option<LoadedStateData>, AgentError> {
        let mut txn = self.db.begin().await?;
        let Some(raw) = txn.read_optional(STATE_DATA_KEY)? else {
            return Ok(None);
        };

        let mut data = match decode(&raw) {
            Ok(data) => data,
            Err(AgentError::UnsupportedStateDataVersion(version)) => {
                // a newer client may have rolled back to us; use what it left for us
                warn!(
                    "State data version {} is not supported, trying {}",
                    version, STATE_DATA_KEY_UNCOMMITTED
                );
                let raw = txn
                    .read_optional(STATE_DATA_KEY_UNCOMMITTED)?
                    .ok_or(AgentError::UnsupportedStateDataVersion(version))?;
                decode(&raw)?
            }
            Err(e) => return Err(e),
        };

        if data.version == 1 {
            info!("Migrating state data from version 1 to {}", STATE_DATA_VERSION);
            data = migrate_v1(&txn, data)?;
        } else {
            data.update_info.has_db_schema_update = false;
        }

        let loop_detected = match self.count_checkpoint(&mut data) {
            Ok(()) => false,
            Err(e) => {
                warn!("{}", e);
                true
            }
        };
        self.stage(&mut txn, &data)?;
        self.db.commit(txn).await?;

        Ok(Some(LoadedStateData {
            data,
            loop_detected,
        }))
    }
}

fn decode(raw: &[u8]) -> Result<StateData, AgentError> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| AgentError::DatabaseValueError(format!("{}: {}", STATE_DATA_KEY, e)))?;
    let version = value
        .get("Version")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| {
            AgentError::DatabaseValueError("State data has no Version field".to_string())
        })?;
    if !(1..=STATE_DATA_VERSION).contains(&version) {
        return Err(AgentError::UnsupportedStateDataVersion(version));
    }
    serde_json::from_value(value)
        .map_err(|e| AgentError::DatabaseValueError(format!("{}: {}", STATE_DATA_KEY, e)))
}

/// Version 1 records only ever described rootfs updates with reboot and
/// rollback. A previous migration may already have written a newer record
/// for the same deployment to the uncommitted key.
fn migrate_v1(txn: &Transaction, old: StateData) -> Result<StateData, AgentError> {
    let mut data = old;
    if let Some(raw) = txn.read_optional(STATE_DATA_KEY_UNCOMMITTED)? {
        let uncommitted = decode(&raw)?;
        if uncommitted.update_info.id == data.update_info.id {
            data = uncommitted;
        }
    }

    data.version = STATE_DATA_VERSION;
    data.update_info.artifact.payload_types = vec![LEGACY_PAYLOAD_TYPE.to_string()];
    data.update_info.reboot_requested = vec![RebootAction::Yes];
    data.update_info.supports_rollback = Some(RollbackSupport::Yes);
    data.update_info.has_db_schema_update = true;
    Ok(data)
}
