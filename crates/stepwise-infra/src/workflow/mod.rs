//! Workflow collaborators backed by the filesystem and subprocesses.
//!
//! - `source` -- subworkflow documents read from disk
//! - `agent` -- agent delegation through an external command
//! - `stages` -- validation stages as configured commands

pub mod agent;
pub mod source;
pub mod stages;

pub use agent::CommandStepExecutor;
pub use source::FsWorkflowSource;
pub use stages::CommandStageRunner;
