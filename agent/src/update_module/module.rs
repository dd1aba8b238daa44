//! Update Module handles

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::artifact::PayloadFile;
use crate::errors::AgentError;
use crate::update_module::call::{self, ModuleOptions};
use crate::update_module::download;
use crate::update_module::file_tree::{FileTree, FileTreeInfo};
use crate::update_module::protocol::{
    parse_needs_reboot, parse_supports_rollback, ModuleCall, RebootAction, RollbackSupport,
};

/// One Update Module bound to the File-Tree of the payload it handles
#[async_trait]
pub trait UpdateModule: Send + Sync {
    fn payload_type(&self) -> &str;

    /// Create a fresh File-Tree for a new deployment
    async fn prepare_file_tree(&self, info: &FileTreeInfo) -> Result<(), AgentError>;

    /// Recreate the File-Tree if it does not exist anymore
    async fn ensure_file_tree(&self, info: &FileTreeInfo) -> Result<(), AgentError>;

    async fn download(&self, files: Vec<PayloadFile>) -> Result<(), AgentError>;

    /// Run a state action; `Ok` iff the module exited with status 0
    async fn call_state(&self, state: ModuleCall) -> Result<(), AgentError>;

    async fn needs_reboot(&self) -> Result<RebootAction, AgentError>;

    async fn supports_rollback(&self) -> Result<RollbackSupport, AgentError>;

    /// Run `Cleanup` and remove the File-Tree. Without a tree there is
    /// nothing left to clean and the module is not called.
    async fn cleanup(&self) -> Result<(), AgentError>;
}

/// Finds the module for a payload type
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    async fn module_for(&self, payload_type: &str) -> Result<Arc<dyn UpdateModule>, AgentError>;
}

/// Module implemented by an executable in the modules directory
pub struct ExecutableModule {
    payload_type: String,
    program: PathBuf,
    tree: FileTree,
    options: ModuleOptions,
}

impl ExecutableModule {
    pub fn new(
        payload_type: &str,
        program: impl Into<PathBuf>,
        work_dir: &Path,
        options: ModuleOptions,
    ) -> Self {
        Self {
            payload_type: payload_type.to_string(),
            program: program.into(),
            tree: FileTree::new(work_dir, 0),
            options,
        }
    }

    pub fn file_tree(&self) -> &FileTree {
        &self.tree
    }

    async fn query(&self, query: ModuleCall) -> Result<String, AgentError> {
        // queries may run before the tree exists
        let cwd = if self.tree.exists().await {
            self.tree.path().to_path_buf()
        } else {
            std::env::temp_dir()
        };
        call::run(&self.program, query, None, &cwd, &self.options).await
    }
}

#[async_trait]
impl UpdateModule for ExecutableModule {
    fn payload_type(&self) -> &str {
        &self.payload_type
    }

    async fn prepare_file_tree(&self, info: &FileTreeInfo) -> Result<(), AgentError> {
        self.tree.prepare(info).await
    }

    async fn ensure_file_tree(&self, info: &FileTreeInfo) -> Result<(), AgentError> {
        self.tree.ensure(info).await
    }

    async fn download(&self, files: Vec<PayloadFile>) -> Result<(), AgentError> {
        download::download(&self.program, &self.tree, files, &self.options).await
    }

    async fn call_state(&self, state: ModuleCall) -> Result<(), AgentError> {
        if state.is_query() {
            return Err(AgentError::Internal(format!("{} is not a state action", state)));
        }
        self.tree.reset_tmp().await?;
        let stdout = call::run(
            &self.program,
            state,
            Some(self.tree.path()),
            self.tree.path(),
            &self.options,
        )
        .await?;
        if !stdout.trim().is_empty() {
            debug!("Ignoring output of {} {}", self.payload_type, state);
        }
        Ok(())
    }

    async fn needs_reboot(&self) -> Result<RebootAction, AgentError> {
        parse_needs_reboot(&self.query(ModuleCall::NeedsArtifactReboot).await?)
    }

    async fn supports_rollback(&self) -> Result<RollbackSupport, AgentError> {
        parse_supports_rollback(&self.query(ModuleCall::SupportsRollback).await?)
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        if !self.tree.exists().await {
            info!("No File-Tree for {}, Cleanup already done", self.payload_type);
            return Ok(());
        }
        let result = call::run(
            &self.program,
            ModuleCall::Cleanup,
            Some(self.tree.path()),
            self.tree.path(),
            &self.options,
        )
        .await;
        self.tree.delete().await?;
        result.map(|_| ())
    }
}

/// Looks modules up as `<modules_dir>/<payload_type>`
#[derive(Debug, Clone)]
pub struct ExecutableModuleRegistry {
    modules_dir: PathBuf,
    work_dir: PathBuf,
    options: ModuleOptions,
}

impl ExecutableModuleRegistry {
    pub fn new(
        modules_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        options: ModuleOptions,
    ) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            work_dir: work_dir.into(),
            options,
        }
    }
}

#[async_trait]
impl ModuleRegistry for ExecutableModuleRegistry {
    async fn module_for(&self, payload_type: &str) -> Result<Arc<dyn UpdateModule>, AgentError> {
        if payload_type.is_empty() || payload_type.contains('/') || payload_type.starts_with('.')
        {
            return Err(AgentError::NoModuleForPayload(payload_type.to_string()));
        }

        let program = self.modules_dir.join(payload_type);
        let executable = match tokio::fs::metadata(&program).await {
            Ok(meta) => {
                use std::os::unix::fs::PermissionsExt;
                meta.is_file() && meta.permissions().mode() & 0o111 != 0
            }
            Err(_) => false,
        };
        if !executable {
            return Err(AgentError::NoModuleForPayload(format!(
                "{} (looked for {})",
                payload_type,
                program.display()
            )));
        }

        Ok(Arc::new(ExecutableModule::new(
            payload_type,
            program,
            &self.work_dir,
            self.options.clone(),
        )))
    }
}
