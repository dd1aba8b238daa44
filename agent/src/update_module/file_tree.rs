//! The File-Tree: working directory handed to an Update Module
//!
//! ```text
//! <work>/payloads/0000/tree/
//!     version
//!     current_artifact_name
//!     current_artifact_group
//!     current_device_type
//!     header/{artifact_name, artifact_group, payload_type, header-info, type-info, meta-data}
//!     tmp/
//!     stream-next, streams/   (during Download)
//!     files/                  (after Download, if the module did not stream)
//! ```

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::debug;

use crate::artifact::ArtifactHeader;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::state_data::StateData;

/// Version of the Update Module protocol the tree follows
pub const FILE_TREE_VERSION: &str = "3";

/// Everything written into a fresh File-Tree
#[derive(Debug, Clone, Default)]
pub struct FileTreeInfo {
    pub artifact_name: String,
    pub artifact_group: String,
    pub payload_type: String,
    pub header_info: serde_json::Value,
    pub type_info: serde_json::Value,
    pub meta_data: serde_json::Value,
    pub current_artifact_name: String,
    pub current_artifact_group: String,
    pub device_type: String,
}

impl FileTreeInfo {
    /// Tree contents for payload `index` of a freshly opened artifact
    pub fn from_header(header: &ArtifactHeader, index: usize) -> Self {
        let payload = header.payloads.get(index).cloned().unwrap_or_default();
        let header_info = json!({
            "payloads": header.payloads.iter().map(|p| json!({"type": p.payload_type})).collect::<Vec<_>>(),
            "artifact_provides": {
                "artifact_name": header.artifact_name,
                "artifact_group": header.artifact_group,
            },
            "artifact_depends": header.depends,
        });

        Self {
            artifact_name: header.artifact_name.clone(),
            artifact_group: header.artifact_group.clone(),
            payload_type: payload.payload_type,
            header_info,
            type_info: payload.type_info,
            meta_data: payload.meta_data,
            ..Default::default()
        }
    }

    /// Tree contents re-derived from persisted state after a restart
    pub fn from_state_data(data: &StateData) -> Self {
        let artifact = &data.update_info.artifact;
        Self {
            artifact_name: artifact.artifact_name.clone(),
            artifact_group: artifact.artifact_group.clone(),
            payload_type: artifact.payload_types.first().cloned().unwrap_or_default(),
            header_info: json!({
                "payloads": artifact.payload_types.iter().map(|t| json!({"type": t})).collect::<Vec<_>>(),
                "artifact_provides": {
                    "artifact_name": artifact.artifact_name,
                    "artifact_group": artifact.artifact_group,
                },
            }),
            ..Default::default()
        }
    }

    pub fn with_current(
        mut self,
        current_artifact_name: &str,
        current_artifact_group: &str,
        device_type: &str,
    ) -> Self {
        self.current_artifact_name = current_artifact_name.to_string();
        self.current_artifact_group = current_artifact_group.to_string();
        self.device_type = device_type.to_string();
        self
    }
}

#[derive(Debug, Clone)]
pub struct FileTree {
    root: Dir,
}

impl FileTree {
    /// Tree of payload `index` under the modules work directory
    pub fn new(work_dir: &Path, index: usize) -> Self {
        Self {
            root: Dir::new(
                work_dir
                    .join("payloads")
                    .join(format!("{:04}", index))
                    .join("tree"),
            ),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub async fn exists(&self) -> bool {
        self.root.exists().await
    }

    pub fn tmp_dir(&self) -> Dir {
        self.root.subdir("tmp")
    }

    pub fn files_dir(&self) -> Dir {
        self.root.subdir("files")
    }

    pub fn streams_dir(&self) -> Dir {
        self.root.subdir("streams")
    }

    pub fn stream_next(&self) -> PathBuf {
        self.root.path().join("stream-next")
    }

    /// Build the tree from scratch, discarding anything left over
    pub async fn prepare(&self, info: &FileTreeInfo) -> Result<(), AgentError> {
        debug!("Preparing File-Tree at {}", self.path().display());
        self.root.recreate().await?;

        let write = |name: &str, contents: &str| {
            let file: File = self.root.file(name);
            let contents = contents.to_string();
            async move { file.write_string(&contents).await }
        };
        write("version", &format!("{}\n", FILE_TREE_VERSION)).await?;
        write("current_artifact_name", &format!("{}\n", info.current_artifact_name)).await?;
        write("current_artifact_group", &format!("{}\n", info.current_artifact_group)).await?;
        write("current_device_type", &format!("{}\n", info.device_type)).await?;

        let header = self.root.subdir("header");
        header.create().await?;
        header.file("artifact_name").write_string(&format!("{}\n", info.artifact_name)).await?;
        header.file("artifact_group").write_string(&format!("{}\n", info.artifact_group)).await?;
        header.file("payload_type").write_string(&format!("{}\n", info.payload_type)).await?;
        header.file("header-info").write_json(&info.header_info).await?;
        header.file("type-info").write_json(&info.type_info).await?;
        header.file("meta-data").write_json(&info.meta_data).await?;

        self.tmp_dir().create().await?;
        Ok(())
    }

    /// Rebuild the tree only if it is gone, e.g. after a restart on a volatile work dir
    pub async fn ensure(&self, info: &FileTreeInfo) -> Result<(), AgentError> {
        if self.exists().await {
            return Ok(());
        }
        self.prepare(info).await
    }

    /// Give the next state an empty scratch directory
    pub async fn reset_tmp(&self) -> Result<(), AgentError> {
        self.tmp_dir().recreate().await
    }

    /// Drop the Download-only streaming entries
    pub async fn remove_streams(&self) -> Result<(), AgentError> {
        self.streams_dir().delete().await?;
        File::new(self.stream_next()).delete().await
    }

    pub async fn delete(&self) -> Result<(), AgentError> {
        self.root.delete().await
    }
}
