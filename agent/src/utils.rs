//! Small helpers shared across the agent

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Build metadata reported by `--version` and in inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
    /// Update Module protocol version spoken by this agent
    pub module_protocol: u32,
}

pub const MODULE_PROTOCOL_VERSION: u32 = 3;

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
        module_protocol: MODULE_PROTOCOL_VERSION,
    }
}

/// Retry spacing for server requests
///
/// Each interval is used `repeats` times before it doubles, and it never
/// grows past `max_delay`.
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub repeats: u32,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(1800),
            repeats: 3,
        }
    }
}

/// Delay before retry number `attempt` (counting from 1)
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let repeats = options.repeats.max(1);
    let doublings = attempt.saturating_sub(1) / repeats;
    let mut delay = options.base_delay.min(options.max_delay);
    for _ in 0..doublings {
        delay = delay.saturating_mul(2).min(options.max_delay);
        if delay == options.max_delay {
            break;
        }
    }
    delay
}

pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
