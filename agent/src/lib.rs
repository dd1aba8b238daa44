//! otagent library
//!
//! Deployment state machine and Update Module protocol of the OTA update agent.

pub mod app;
pub mod artifact;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod storage;
pub mod update_module;
pub mod utils;
