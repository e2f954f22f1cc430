//! Autonomy gate: how far an agent's result is trusted relative to the
//! deterministic handler.
//!
//! | Level        | Agent ok, schema ok | Schema violation          | Agent error/timeout |
//! |--------------|---------------------|---------------------------|---------------------|
//! | Operator     | refused             | refused                   | refused             |
//! | Collaborator | handler output wins | handler output wins       | handler fallback    |
//! | Consultant   | accepted            | accepted with a warning   | handler fallback    |
//! | Approver     | accepted            | handler fallback          | handler fallback    |
//!
//! Every fallback is a single attempt. Without a handler the agent-side
//! error propagates; a Collaborator without a handler behaves like Approver.

use serde_json::Value;
use stepwise_types::error::{ErrorKind, FallbackReason};
use stepwise_types::event::GateDecision;
use stepwise_types::workflow::AutonomyLevel;

/// What the agent call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAttempt {
    Succeeded(Value),
    /// `reason` is `AgentError` or `AgentTimeout`.
    Failed { reason: FallbackReason, error: String },
}

/// The gate's ruling for one agent-mode step.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    /// Use the agent's value. Non-empty `violations` means accepted with a
    /// schema warning.
    Accept { value: Value, violations: Vec<String> },
    /// Invoke the handler once; its result is the step output.
    UseHandler {
        reason: FallbackReason,
        /// Agent proposal handed to the handler for validation.
        proposal: Option<Value>,
        /// Agent-side failure that triggered the fallback, if any.
        agent_error: Option<String>,
    },
    /// Fail the step.
    Reject { kind: ErrorKind, message: String },
}

impl GateVerdict {
    pub fn decision(&self) -> GateDecision {
        match self {
            GateVerdict::Accept { violations, .. } if violations.is_empty() => {
                GateDecision::Accepted
            }
            GateVerdict::Accept { .. } => GateDecision::AcceptedWithWarning,
            GateVerdict::UseHandler { .. } => GateDecision::HandlerAuthoritative,
            GateVerdict::Reject { .. } => GateDecision::Rejected,
        }
    }
}

/// Whether a level lets a step run in agent mode at all.
pub fn admits_agent(level: AutonomyLevel) -> bool {
    !matches!(level, AutonomyLevel::Operator)
}

/// Rule on an agent attempt.
///
/// `schema_check` verifies the declared output contract and returns the
/// violations; it is only called for successful attempts. Operator never
/// reaches the gate (see [`admits_agent`]) and is ruled on like Approver.
pub fn decide<F>(
    level: AutonomyLevel,
    attempt: AgentAttempt,
    schema_check: F,
    has_handler: bool,
) -> GateVerdict
where
    F: FnOnce(&Value) -> Result<(), Vec<String>>,
{
    let value = match attempt {
        AgentAttempt::Failed { reason, error } => {
            return if has_handler {
                GateVerdict::UseHandler {
                    reason,
                    proposal: None,
                    agent_error: Some(error),
                }
            } else {
                GateVerdict::Reject {
                    kind: ErrorKind::AgentExecutionError,
                    message: error,
                }
            };
        }
        AgentAttempt::Succeeded(value) => value,
    };

    if level == AutonomyLevel::Collaborator && has_handler {
        return GateVerdict::UseHandler {
            reason: FallbackReason::CollaboratorValidationUsedHandler,
            proposal: Some(value),
            agent_error: None,
        };
    }

    match schema_check(&value) {
        Ok(()) => GateVerdict::Accept {
            value,
            violations: Vec::new(),
        },
        Err(violations) if level == AutonomyLevel::Consultant => {
            GateVerdict::Accept { value, violations }
        }
        Err(_) if has_handler => GateVerdict::UseHandler {
            reason: FallbackReason::SchemaViolation,
            proposal: None,
            agent_error: None,
        },
        Err(violations) => GateVerdict::Reject {
            kind: ErrorKind::OutputSchemaViolation,
            message: format!("agent output violates the output schema: {}", violations.join("; ")),
        },
    }
}
