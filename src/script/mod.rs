//! Loading scripts and running their batches.

pub mod batch;
pub mod loader;
pub mod runner;

pub use batch::{Batch, split};
pub use loader::{LoadError, Script, collect_script_paths, script_name};
pub use runner::{BoxError, Connection, ExecutionError, RunReport, ScriptReport, ScriptRunner};
