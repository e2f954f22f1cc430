//! Error taxonomy and user-visible failure reports.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::StepType;

/// Classification of why a run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unresolved reference or type mismatch in an expression.
    EvaluationError,
    /// Unknown step type, missing handler or missing collaborator.
    StepDispatchError,
    /// Agent call raised or timed out.
    AgentExecutionError,
    /// Agent result failed the declared output contract.
    OutputSchemaViolation,
    /// Persisted checkpoint is unreadable or invalid.
    CheckpointCorruptionError,
    /// Checkpoint could not be written.
    CheckpointWriteError,
    /// A deterministic handler returned an error.
    HandlerFailure,
    /// A validation stage reported failure.
    ValidationFailure,
    /// A handler or stage exceeded its timeout.
    Timeout,
    /// Invalid workflow document or run inputs.
    DefinitionError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EvaluationError => "evaluation_error",
            ErrorKind::StepDispatchError => "step_dispatch_error",
            ErrorKind::AgentExecutionError => "agent_execution_error",
            ErrorKind::OutputSchemaViolation => "output_schema_violation",
            ErrorKind::CheckpointCorruptionError => "checkpoint_corruption_error",
            ErrorKind::CheckpointWriteError => "checkpoint_write_error",
            ErrorKind::HandlerFailure => "handler_failure",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DefinitionError => "definition_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the dispatcher switched from an agent result to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    AgentError,
    AgentTimeout,
    SchemaViolation,
    CollaboratorValidationUsedHandler,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::AgentError => "agent_error",
            FallbackReason::AgentTimeout => "agent_timeout",
            FallbackReason::SchemaViolation => "schema_violation",
            FallbackReason::CollaboratorValidationUsedHandler => {
                "collaborator_validation_used_handler"
            }
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a fallback was tried for the failing step, and how it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackOutcome {
    pub attempted: bool,
    pub succeeded: bool,
}

/// Everything an operator needs to understand an aborted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Failing step name (or `outputs.<name>` for output bindings).
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackOutcome>,
    /// Outputs that did complete, e.g. the successful children of a
    /// failed parallel step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<Value>,
}

impl FailureReport {
    pub fn new(
        step: impl Into<String>,
        step_type: Option<StepType>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            step_type,
            kind,
            message: message.into(),
            fallback: None,
            partial_output: None,
        }
    }

    pub fn with_fallback(mut self, attempted: bool, succeeded: bool) -> Self {
        self.fallback = Some(FallbackOutcome {
            attempted,
            succeeded,
        });
        self
    }

    pub fn with_partial_output(mut self, output: Value) -> Self {
        self.partial_output = Some(output);
        self
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step_type {
            Some(t) => write!(f, "step '{}' ({t}) failed", self.step)?,
            None => write!(f, "'{}' failed", self.step)?,
        }
        write!(f, " [{}]: {}", self.kind, self.message)?;
        if let Some(fb) = self.fallback {
            if fb.attempted {
                let verdict = if fb.succeeded { "succeeded" } else { "failed" };
                write!(f, " (fallback attempted, {verdict})")?;
            }
        }
        Ok(())
    }
}
