//! Named pipes used to stream payloads to Update Modules

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use nix::sys::stat::Mode;
use tokio::net::unix::pipe;

use crate::errors::AgentError;

/// How often to check whether the reader side of a FIFO has shown up
pub const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Create a FIFO readable and writable only by the owner
pub fn create_fifo(path: &Path) -> Result<(), AgentError> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
        AgentError::IoError(std::io::Error::new(
            std::io::Error::from(e).kind(),
            format!("Unable to create FIFO {}: {}", path.display(), e),
        ))
    })
}

/// Try to open the writing end of a FIFO without blocking.
///
/// Returns `Ok(None)` while nobody has the FIFO open for reading.
pub fn try_open_sender(path: &Path) -> Result<Option<pipe::Sender>, AgentError> {
    match pipe::OpenOptions::new().open_sender(path) {
        Ok(sender) => Ok(Some(sender)),
        Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => Ok(None),
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e.into()),
    }
}
