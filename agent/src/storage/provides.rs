//! Committed artifact identity: name, group and provides
//!
//! `artifact-name` and `artifact-group` hold plain strings, `artifact-provides`
//! holds the remaining provides as a JSON object.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::AgentError;
use crate::storage::database::{KeyValueDatabase, Transaction};

pub const ARTIFACT_NAME_KEY: &str = "artifact-name";
pub const ARTIFACT_GROUP_KEY: &str = "artifact-group";
pub const ARTIFACT_PROVIDES_KEY: &str = "artifact-provides";

/// Appended to the artifact name when the device may be left half-updated
pub const BROKEN_ARTIFACT_SUFFIX: &str = "_INCONSISTENT";

pub const PROVIDES_NAME: &str = "artifact_name";
pub const PROVIDES_GROUP: &str = "artifact_group";
pub const DEPENDS_DEVICE_TYPE: &str = "device_type";

pub type ProvidesData = BTreeMap<String, String>;

pub fn add_inconsistent_suffix(name: &str) -> String {
    if name.ends_with(BROKEN_ARTIFACT_SUFFIX) {
        name.to_string()
    } else {
        format!("{}{}", name, BROKEN_ARTIFACT_SUFFIX)
    }
}

fn read_string(txn: &Transaction, key: &str) -> Result<Option<String>, AgentError> {
    txn.read_optional(key)?
        .map(|raw| {
            String::from_utf8(raw)
                .map_err(|e| AgentError::DatabaseValueError(format!("{}: {}", key, e)))
        })
        .transpose()
}

/// Current provides, including `artifact_name` and `artifact_group`
pub fn load_provides_in(txn: &Transaction) -> Result<ProvidesData, AgentError> {
    let mut provides = match txn.read_optional(ARTIFACT_PROVIDES_KEY)? {
        Some(raw) if !raw.is_empty() => serde_json::from_slice::<ProvidesData>(&raw).map_err(
            |e| AgentError::DatabaseValueError(format!("{}: {}", ARTIFACT_PROVIDES_KEY, e)),
        )?,
        _ => ProvidesData::new(),
    };

    if let Some(name) = read_string(txn, ARTIFACT_NAME_KEY)? {
        provides.insert(PROVIDES_NAME.to_string(), name);
    }
    if let Some(group) = read_string(txn, ARTIFACT_GROUP_KEY)? {
        provides.insert(PROVIDES_GROUP.to_string(), group);
    }
    Ok(provides)
}

pub async fn load_provides(db: &dyn KeyValueDatabase) -> Result<ProvidesData, AgentError> {
    let txn = db.begin().await?;
    load_provides_in(&txn)
}

/// Wildcard match where `*` stands for any run of characters
pub fn clears_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// What the new artifact says about provides
#[derive(Debug, Clone, Default)]
pub struct ArtifactData<'a> {
    pub artifact_name: &'a str,
    pub artifact_group: &'a str,
    pub provides: Option<&'a ProvidesData>,
    pub clears_provides: Option<&'a [String]>,
}

/// Stage the committed identity for a finished deployment in `txn`.
///
/// Without provides and clears everything is replaced. Clears alone filter
/// the existing provides; provides alone replace them; both filter first and
/// then add.
pub fn commit_artifact_data_in(
    txn: &mut Transaction,
    artifact: &ArtifactData<'_>,
) -> Result<(), AgentError> {
    let existing = load_provides_in(txn)?;

    let mut modified = match (artifact.provides, artifact.clears_provides) {
        (None, None) => ProvidesData::new(),
        (None, Some(clears)) => filter_provides(existing, clears),
        (Some(provides), None) => provides.clone(),
        (Some(provides), Some(clears)) => {
            let mut filtered = filter_provides(existing, clears);
            filtered.extend(provides.iter().map(|(k, v)| (k.clone(), v.clone())));
            filtered
        }
    };

    if !artifact.artifact_name.is_empty() {
        modified.insert(PROVIDES_NAME.to_string(), artifact.artifact_name.to_string());
    }
    if !artifact.artifact_group.is_empty() {
        modified.insert(PROVIDES_GROUP.to_string(), artifact.artifact_group.to_string());
    }

    let name = modified.remove(PROVIDES_NAME).unwrap_or_default();
    if name.is_empty() {
        return Err(AgentError::ValidationError(
            "Refusing to commit an empty artifact name".to_string(),
        ));
    }
    txn.write(ARTIFACT_NAME_KEY, name.as_bytes());

    match modified.remove(PROVIDES_GROUP) {
        Some(group) if !group.is_empty() => txn.write(ARTIFACT_GROUP_KEY, group.as_bytes()),
        _ => txn.remove(ARTIFACT_GROUP_KEY),
    }

    if modified.is_empty() {
        txn.remove(ARTIFACT_PROVIDES_KEY);
    } else {
        txn.write(ARTIFACT_PROVIDES_KEY, &serde_json::to_vec(&modified)?);
    }

    debug!("Staged artifact data for {}", name);
    Ok(())
}

fn filter_provides(mut provides: ProvidesData, clears: &[String]) -> ProvidesData {
    provides.retain(|key, _| {
        key == PROVIDES_NAME
            || key == PROVIDES_GROUP
            || !clears.iter().any(|pattern| clears_match(pattern, key))
    });
    provides
}

/// Check artifact depends against the device type and current provides
pub fn check_depends(
    depends: &BTreeMap<String, Vec<String>>,
    provides: &ProvidesData,
    device_type: &str,
) -> Result<(), AgentError> {
    for (key, accepted) in depends {
        if key == DEPENDS_DEVICE_TYPE {
            if !accepted.iter().any(|t| t == device_type) {
                return Err(AgentError::DependsMismatch(format!(
                    "Artifact is not compatible with device type {} (accepts {:?})",
                    device_type, accepted
                )));
            }
            continue;
        }

        match provides.get(key) {
            Some(value) if accepted.contains(value) => {}
            Some(value) => {
                return Err(AgentError::DependsMismatch(format!(
                    "{} is {}, artifact requires one of {:?}",
                    key, value, accepted
                )));
            }
            None => {
                return Err(AgentError::DependsMismatch(format!(
                    "Artifact depends on {} which the device does not provide",
                    key
                )));
            }
        }
    }
    Ok(())
}
