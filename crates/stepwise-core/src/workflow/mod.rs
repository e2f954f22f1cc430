//! Workflow engine core: definitions, evaluation, dispatch and checkpointing.
//!
//! - `definition` -- YAML parsing, structural and reference validation, input resolution
//! - `expression` -- guard/template expression language and the `Evaluator`
//! - `context` -- execution context backed by a fixed slot arena
//! - `schema` -- cached JSON Schema checks for agent output contracts
//! - `handler` -- deterministic step handlers and their registry
//! - `collaborator` -- agent, validation-stage and subworkflow ports
//! - `gate` -- autonomy levels and how far agent results are trusted
//! - `checkpoint` -- durable per-step checkpoint manager
//! - `dispatcher` -- mode-aware step dispatch for every step type
//! - `parallel` -- bounded fan-out for `parallel` steps

pub mod checkpoint;
pub mod collaborator;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod expression;
pub mod gate;
pub mod handler;
pub mod parallel;
pub mod schema;

pub use dispatcher::{
    Dispatcher, DispatcherBuilder, DispatcherConfig, EngineError, RunOptions, RunOutcome, RunStatus,
};
