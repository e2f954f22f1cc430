//! Events emitted by the dispatcher.
//!
//! `WorkflowEvent` is broadcast on the engine's event bus and also collected
//! into the run's decision trace. All variants are Clone + Send + Sync for
//! use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, FallbackReason};
use crate::workflow::{AutonomyLevel, ExecutionMode, StepType};

/// Events emitted during a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        dry_run: bool,
    },

    /// A run started from an existing checkpoint.
    RunResumed {
        run_id: Uuid,
        workflow: String,
        restored_steps: usize,
    },

    StepStarted {
        run_id: Uuid,
        step: String,
        step_type: StepType,
    },

    StepSkipped {
        run_id: Uuid,
        step: String,
        reason: SkipReason,
    },

    /// Execution mode chosen for a step. `forced` is set when the requested
    /// mode was overridden.
    ModeSelected {
        run_id: Uuid,
        step: String,
        requested: ExecutionMode,
        selected: ExecutionMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forced: Option<String>,
    },

    AutonomyDecision {
        run_id: Uuid,
        step: String,
        autonomy: AutonomyLevel,
        decision: GateDecision,
    },

    FallbackOccurred {
        run_id: Uuid,
        step: String,
        reason: FallbackReason,
        succeeded: bool,
    },

    /// Consultant-level warning: agent output accepted despite a mismatch.
    SchemaMismatch {
        run_id: Uuid,
        step: String,
        violations: Vec<String>,
    },

    StepCompleted {
        run_id: Uuid,
        step: String,
        duration_ms: u64,
        fallback: bool,
    },

    StepFailed {
        run_id: Uuid,
        step: String,
        kind: ErrorKind,
        error: String,
    },

    CheckpointWritten {
        run_id: Uuid,
        step: String,
        sequence: u64,
    },

    RunCompleted {
        run_id: Uuid,
        workflow: String,
        duration_ms: u64,
        steps_completed: usize,
    },

    RunFailed {
        run_id: Uuid,
        workflow: String,
        step: String,
        kind: ErrorKind,
    },

    RunCancelled {
        run_id: Uuid,
        workflow: String,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::RunResumed { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::ModeSelected { run_id, .. }
            | WorkflowEvent::AutonomyDecision { run_id, .. }
            | WorkflowEvent::FallbackOccurred { run_id, .. }
            | WorkflowEvent::SchemaMismatch { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::CheckpointWritten { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::RunCancelled { run_id, .. } => *run_id,
        }
    }

    /// Step the event refers to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStarted { step, .. }
            | WorkflowEvent::StepSkipped { step, .. }
            | WorkflowEvent::ModeSelected { step, .. }
            | WorkflowEvent::AutonomyDecision { step, .. }
            | WorkflowEvent::FallbackOccurred { step, .. }
            | WorkflowEvent::SchemaMismatch { step, .. }
            | WorkflowEvent::StepCompleted { step, .. }
            | WorkflowEvent::StepFailed { step, .. }
            | WorkflowEvent::CheckpointWritten { step, .. }
            | WorkflowEvent::RunFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Short snake_case label for tables and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowEvent::RunStarted { .. } => "run_started",
            WorkflowEvent::RunResumed { .. } => "run_resumed",
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepSkipped { .. } => "step_skipped",
            WorkflowEvent::ModeSelected { .. } => "mode_selected",
            WorkflowEvent::AutonomyDecision { .. } => "autonomy_decision",
            WorkflowEvent::FallbackOccurred { .. } => "fallback_occurred",
            WorkflowEvent::SchemaMismatch { .. } => "schema_mismatch",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::StepFailed { .. } => "step_failed",
            WorkflowEvent::CheckpointWritten { .. } => "checkpoint_written",
            WorkflowEvent::RunCompleted { .. } => "run_completed",
            WorkflowEvent::RunFailed { .. } => "run_failed",
            WorkflowEvent::RunCancelled { .. } => "run_cancelled",
        }
    }
}

/// Why a step did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `when` guard evaluated falsy.
    Guard,
    /// Output restored from a checkpoint entry.
    Checkpointed,
}

/// Outcome of the autonomy gate for one agent-mode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Operator level: agent mode refused.
    Refused,
    /// Agent result accepted as the step output.
    Accepted,
    /// Agent result accepted with a schema warning.
    AcceptedWithWarning,
    /// Handler result used instead of the agent's.
    HandlerAuthoritative,
    /// Agent result rejected with no handler to fall back to.
    Rejected,
}
