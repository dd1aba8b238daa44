//! Deployment state machine
//!
//! States are entered by the [`orchestrator`], which writes a checkpoint to
//! the state data before every checkpoint state runs so an interrupted
//! deployment continues where it left off. The [`catalog`] holds what each
//! state does and [`fsm`] where it goes next.

pub mod catalog;
pub mod context;
pub mod daemon;
pub mod fsm;
pub mod orchestrator;
pub mod reboot;
pub mod standalone;
pub mod states;

pub use catalog::DeploymentMachine;
pub use context::{DeploymentContext, DeploymentOptions, RunReport};
pub use states::{Event, Flavor, State};
