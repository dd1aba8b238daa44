//! Artifact header

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::storage::provides::ProvidesData;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub artifact_name: String,

    #[serde(default)]
    pub artifact_group: String,

    /// Requirements on the device; single values are accepted in place of lists
    #[serde(default, deserialize_with = "one_or_many")]
    pub depends: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub provides: Option<ProvidesData>,

    #[serde(default)]
    pub clears_provides: Option<Vec<String>>,

    #[serde(default)]
    pub payloads: Vec<PayloadHeader>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadHeader {
    /// Update Module handling the payload; empty for metadata-only artifacts
    #[serde(rename = "type", default)]
    pub payload_type: String,

    #[serde(default)]
    pub type_info: serde_json::Value,

    #[serde(default)]
    pub meta_data: serde_json::Value,
}

impl ArtifactHeader {
    /// An artifact without payload data only changes the committed identity
    pub fn is_empty_payload(&self) -> bool {
        self.payloads.iter().all(|p| p.payload_type.is_empty())
    }

    pub fn payload_types(&self) -> Vec<String> {
        self.payloads
            .iter()
            .filter(|p| !p.payload_type.is_empty())
            .map(|p| p.payload_type.clone())
            .collect()
    }

    /// Device types listed in the depends section
    pub fn device_types_compatible(&self) -> Vec<String> {
        self.depends
            .get(crate::storage::provides::DEPENDS_DEVICE_TYPE)
            .cloned()
            .unwrap_or_default()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| match value {
            OneOrMany::One(v) => (key, vec![v]),
            OneOrMany::Many(v) => (key, v),
        })
        .collect())
}
