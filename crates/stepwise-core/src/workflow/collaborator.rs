//! Narrow interfaces to the engine's external collaborators.
//!
//! - `StepExecutor` -- the agent delegate for agent-mode, `agent` and
//!   `generate` steps
//! - `StageRunner` -- runs named validation stages for `validate` steps
//! - `WorkflowSource` -- resolves `subworkflow` references
//!
//! Concrete implementations (subprocesses, filesystem) live in the
//! infrastructure crate.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::delegation::DelegationRequest;
use stepwise_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),

    #[error("no step executor is configured")]
    Unavailable,

    #[error("agent returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Delegates a step to an AI agent.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, request: DelegationRequest) -> BoxFuture<'_, Result<Value, AgentError>>;
}

// ---------------------------------------------------------------------------
// StageRunner
// ---------------------------------------------------------------------------

/// Result of one validation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("unknown validation stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{stage}' could not run: {reason}")]
    Failed { stage: String, reason: String },
}

/// Runs named validation stages.
pub trait StageRunner: Send + Sync {
    fn run_stage<'a>(
        &'a self,
        stage: &'a str,
        inputs: &'a Value,
    ) -> BoxFuture<'a, Result<StageReport, StageError>>;
}

// ---------------------------------------------------------------------------
// WorkflowSource
// ---------------------------------------------------------------------------

/// Resolves a subworkflow reference to a validated definition.
pub trait WorkflowSource: Send + Sync {
    fn load<'a>(
        &'a self,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<WorkflowDefinition, DefinitionError>>;
}

/// Definitions registered by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkflowSource {
    definitions: HashMap<String, WorkflowDefinition>,
}

impl MemoryWorkflowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, def: WorkflowDefinition) -> &mut Self {
        self.definitions.insert(reference.into(), def);
        self
    }
}

impl WorkflowSource for MemoryWorkflowSource {
    fn load<'a>(
        &'a self,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<WorkflowDefinition, DefinitionError>> {
        Box::pin(async move {
            self.definitions
                .get(reference)
                .cloned()
                .ok_or_else(|| DefinitionError::NotFound(reference.to_string()))
        })
    }
}
