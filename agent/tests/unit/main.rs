//! Integration tests for the update agent

mod common;
mod test_standalone;
mod test_update_module;
