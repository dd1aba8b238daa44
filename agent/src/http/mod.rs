//! Communication with the deployment server

pub mod client;
pub mod deployments;
