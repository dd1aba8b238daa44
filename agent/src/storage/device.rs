//! Device type file parsing

use crate::errors::AgentError;
use crate::filesys::file::File;

/// Parse the contents of a `device_type` file.
///
/// The file holds a single `device_type=<type>` line. Blank lines are ignored.
pub fn parse_device_type(contents: &str) -> Result<String, AgentError> {
    let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());

    let line = lines
        .next()
        .ok_or_else(|| AgentError::ConfigError("device_type file is empty".to_string()))?;
    if lines.next().is_some() {
        return Err(AgentError::ConfigError(
            "device_type file has more than one entry".to_string(),
        ));
    }

    match line.split_once('=') {
        Some((key, value)) if key.trim() == "device_type" && !value.trim().is_empty() => {
            Ok(value.trim().to_string())
        }
        _ => Err(AgentError::ConfigError(format!(
            "Malformed device_type entry: {}",
            line
        ))),
    }
}

/// Load the device type from file
pub async fn load_device_type(device_type_file: &File) -> Result<String, AgentError> {
    let contents = device_type_file.read_string().await.map_err(|e| {
        AgentError::ConfigError(format!(
            "Unable to read {}: {}",
            device_type_file.path().display(),
            e
        ))
    })?;
    parse_device_type(&contents)
}
