//! Running an Update Module process
//!
//! Every call gets its own process group so that a timeout can take down
//! whatever the module spawned as well.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::logs::MODULE_OUTPUT_TARGET;
use crate::update_module::protocol::ModuleCall;

/// Limits applied to each module invocation
#[derive(Debug, Clone)]
pub struct ModuleOptions {
    /// Maximum run time of a single call
    pub timeout: Duration,

    /// Time between SIGTERM and SIGKILL after a timeout
    pub kill_grace: Duration,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4 * 60 * 60),
            kill_grace: Duration::from_secs(60),
        }
    }
}

/// A running module invocation
pub struct ModuleProcess {
    label: String,
    child: Child,
    pgid: Option<Pid>,
    stdout: Option<JoinHandle<std::io::Result<String>>>,
    stderr: Option<JoinHandle<()>>,
    deadline: Instant,
    kill_grace: Duration,
}

impl ModuleProcess {
    /// Start `<program> <call> [<tree>]` with `cwd` as working directory
    pub fn spawn(
        program: &Path,
        call: ModuleCall,
        tree_arg: Option<&Path>,
        cwd: &Path,
        options: &ModuleOptions,
    ) -> Result<Self, AgentError> {
        let label = format!(
            "{} {}",
            program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            call
        );

        let mut command = Command::new(program);
        command.arg(call.as_str());
        if let Some(tree) = tree_arg {
            command.arg(tree);
        }
        command
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!("Calling Update Module: {}", label);
        let mut child = command.spawn().map_err(|e| {
            AgentError::ModuleError(format!("Unable to start {}: {}", program.display(), e))
        })?;

        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        let stdout = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = String::new();
                out.read_to_string(&mut buf).await?;
                Ok(buf)
            })
        });
        let stderr = child.stderr.take().map(|err| {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: MODULE_OUTPUT_TARGET, "[{}] {}", label, line);
                }
            })
        });

        Ok(Self {
            label,
            child,
            pgid,
            stdout,
            stderr,
            deadline: Instant::now() + options.timeout,
            kill_grace: options.kill_grace,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the process has already terminated, without waiting
    pub fn has_exited(&mut self) -> Result<bool, AgentError> {
        Ok(self.child.try_wait()?.is_some())
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Wait for the process to finish and return its stdout.
    ///
    /// A non-zero exit is a `ModuleError`; running past the deadline kills
    /// the process group and yields `ModuleTimeout`.
    pub async fn wait(mut self) -> Result<String, AgentError> {
        let status = tokio::time::timeout_at(self.deadline, self.child.wait()).await;
        let status = match status {
            Ok(status) => status?,
            Err(_) => {
                warn!("{} timed out, terminating", self.label);
                self.terminate().await;
                return Err(AgentError::ModuleTimeout(self.label.clone()));
            }
        };

        // a background child of the module may keep the pipes open
        let stdout = match tokio::time::timeout(self.kill_grace, self.collect_output()).await {
            Ok(stdout) => stdout,
            Err(_) => {
                warn!("{} left its output pipes open, ignoring output", self.label);
                Ok(String::new())
            }
        };
        check_status(&self.label, status)?;
        let stdout = stdout?;
        if !stdout.is_empty() {
            debug!(target: MODULE_OUTPUT_TARGET, "[{}] stdout: {:?}", self.label, stdout);
        }
        Ok(stdout)
    }

    async fn collect_output(&mut self) -> Result<String, AgentError> {
        if let Some(stderr) = self.stderr.take() {
            let _ = stderr.await;
        }
        match self.stdout.take() {
            Some(handle) => handle
                .await
                .map_err(|e| AgentError::Internal(e.to_string()))?
                .map_err(AgentError::from),
            None => Ok(String::new()),
        }
    }

    async fn terminate(&mut self) {
        self.signal_group(Signal::SIGTERM);
        if tokio::time::timeout(self.kill_grace, self.child.wait())
            .await
            .is_err()
        {
            warn!("{} ignored SIGTERM, killing", self.label);
            self.signal_group(Signal::SIGKILL);
            let _ = self.child.kill().await;
        }
        if let Some(stdout) = self.stdout.take() {
            stdout.abort();
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }

    fn signal_group(&self, signal: Signal) {
        if let Some(pgid) = self.pgid {
            if let Err(e) = killpg(pgid, signal) {
                debug!("Unable to send {} to {}: {}", signal, self.label, e);
            }
        }
    }
}

fn check_status(label: &str, status: ExitStatus) -> Result<(), AgentError> {
    if status.success() {
        return Ok(());
    }
    Err(AgentError::ModuleError(match status.code() {
        Some(code) => format!("{} exited with status {}", label, code),
        None => format!("{} was terminated by a signal", label),
    }))
}

/// Run a call to completion
pub async fn run(
    program: &Path,
    call: ModuleCall,
    tree_arg: Option<&Path>,
    cwd: &Path,
    options: &ModuleOptions,
) -> Result<String, AgentError> {
    ModuleProcess::spawn(program, call, tree_arg, cwd, options)?
        .wait()
        .await
}
