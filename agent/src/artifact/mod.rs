//! Artifact access
//!
//! Parsing and verifying the artifact container is someone else's job; the
//! deployment only needs the header and a stream per payload file. The
//! directory-backed implementation here reads an artifact that has already
//! been unpacked and verified.

pub mod header;
pub mod unpacked;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::errors::AgentError;

pub use header::{ArtifactHeader, PayloadHeader};

/// One file of a payload, readable once
pub struct PayloadFile {
    pub name: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for PayloadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadFile").field("name", &self.name).finish()
    }
}

/// An opened artifact
#[async_trait]
pub trait Artifact: Send + Sync {
    fn header(&self) -> &ArtifactHeader;

    /// Open the files of payload `index` in artifact order
    async fn payload_files(&mut self, index: usize) -> Result<Vec<PayloadFile>, AgentError>;
}

/// Opens artifacts from a deployment's source locator
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Box<dyn Artifact>, AgentError>;
}
