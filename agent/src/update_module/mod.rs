//! Update Module adapter: runs one executable per payload type through the
//! module protocol, with a File-Tree as its working area

pub mod call;
pub mod download;
pub mod file_tree;
pub mod module;
pub mod protocol;

pub use module::{ExecutableModule, ExecutableModuleRegistry, ModuleRegistry, UpdateModule};
pub use protocol::{ModuleCall, RebootAction, RollbackSupport};
