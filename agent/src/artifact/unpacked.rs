//! Artifacts unpacked into a directory
//!
//! Layout: `header.json` next to `data/0000/`, `data/0001/`, ... holding the
//! files of each payload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::artifact::{Artifact, ArtifactHeader, ArtifactSource, PayloadFile};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

pub struct UnpackedArtifact {
    root: PathBuf,
    header: ArtifactHeader,
}

impl UnpackedArtifact {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let root = root.into();
        let header_file = File::new(root.join("header.json"));
        let header: ArtifactHeader = header_file.read_json().await.map_err(|e| {
            AgentError::ArtifactError(format!(
                "Unable to read artifact header {}: {}",
                header_file.path().display(),
                e
            ))
        })?;
        if header.artifact_name.is_empty() {
            return Err(AgentError::ArtifactError(
                "Artifact header has no artifact_name".to_string(),
            ));
        }

        debug!("Opened artifact {} at {}", header.artifact_name, root.display());
        Ok(Self { root, header })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Artifact for UnpackedArtifact {
    fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    async fn payload_files(&mut self, index: usize) -> Result<Vec<PayloadFile>, AgentError> {
        let dir = Dir::new(self.root.join("data").join(format!("{:04}", index)));
        if !dir.exists().await {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for path in dir.list_files().await? {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    AgentError::ArtifactError(format!("Bad payload file name: {}", path.display()))
                })?
                .to_string();
            let reader = tokio::fs::File::open(&path).await?;
            files.push(PayloadFile {
                name,
                reader: Box::new(reader),
            });
        }
        Ok(files)
    }
}

/// Opens unpacked artifacts from local paths or `file://` URLs
#[derive(Debug, Clone, Default)]
pub struct UnpackedArtifactSource;

impl UnpackedArtifactSource {
    fn resolve(uri: &str) -> Result<PathBuf, AgentError> {
        if !uri.contains("://") {
            return Ok(PathBuf::from(uri));
        }

        let url = Url::parse(uri)
            .map_err(|e| AgentError::ArtifactError(format!("Bad artifact URI {}: {}", uri, e)))?;
        match url.scheme() {
            "file" => url.to_file_path().map_err(|_| {
                AgentError::ArtifactError(format!("Bad artifact file URI: {}", uri))
            }),
            scheme => Err(AgentError::Unsupported(format!(
                "Artifact source scheme {} is not supported",
                scheme
            ))),
        }
    }
}

#[async_trait]
impl ArtifactSource for UnpackedArtifactSource {
    async fn open(&self, uri: &str) -> Result<Box<dyn Artifact>, AgentError> {
        let path = Self::resolve(uri)?;
        Ok(Box::new(UnpackedArtifact::open(path).await?))
    }
}
