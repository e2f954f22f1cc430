//! Workflow document types.
//!
//! A workflow is a YAML document with typed `inputs`, an ordered `steps` list
//! and `outputs` templates. Every step carries a `type` tag selecting one of
//! a closed set of step kinds; the kind-specific fields sit next to the
//! common ones:
//!
//! ```yaml
//! name: release
//! version: 1.0.0
//! inputs:
//!   branch_name: { type: string }
//! steps:
//!   - name: create_branch
//!     type: python
//!     action: create_branch
//!     inputs: { name: "{{ inputs.branch_name }}" }
//!     mode: agent
//!     autonomy: collaborator
//! outputs:
//!   branch: "{{ steps.create_branch.output }}"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A parsed workflow document. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name, also used to key checkpoint files.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Typed input declarations keyed by input name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputDeclaration>,
    /// Ordered top-level steps.
    pub steps: Vec<StepDefinition>,
    /// Output bindings: name -> template evaluated against the final context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    /// Every step in the document, depth-first in declaration order.
    pub fn all_steps(&self) -> Vec<&StepDefinition> {
        let mut out = Vec::new();
        for step in &self.steps {
            step.walk(&mut out);
        }
        out
    }
}

/// Declaration of a single workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDeclaration {
    #[serde(rename = "type", default)]
    pub kind: InputType,
    /// Explicit requiredness. When omitted, an input is required unless it
    /// declares a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputDeclaration {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }
}

/// Primitive type of a workflow input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    List,
    Map,
    #[default]
    Any,
}

impl InputType {
    /// Whether a JSON value is acceptable for this input type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Boolean => value.is_boolean(),
            InputType::List => value.is_array(),
            InputType::Map => value.is_object(),
            InputType::Any => true,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Integer => "integer",
            InputType::Boolean => "boolean",
            InputType::List => "list",
            InputType::Map => "map",
            InputType::Any => "any",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step. `kind` and `config` are flattened so that the YAML keeps
/// a single flat mapping per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow document (including nested children).
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Guard expression; the step is skipped when it evaluates falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Direct children of a control-flow step, in declaration order.
    pub fn children(&self) -> Vec<&StepDefinition> {
        match &self.kind {
            StepKind::Parallel { steps, .. } | StepKind::Loop { steps, .. } => {
                steps.iter().collect()
            }
            StepKind::Branch {
                then, otherwise, ..
            } => then.iter().chain(otherwise.iter()).collect(),
            _ => Vec::new(),
        }
    }

    /// Push this step and all of its descendants onto `out`.
    pub fn walk<'a>(&'a self, out: &mut Vec<&'a StepDefinition>) {
        out.push(self);
        for child in self.children() {
            child.walk(out);
        }
    }

    /// Names of all descendants (excluding this step).
    pub fn descendant_names(&self) -> Vec<String> {
        let mut all = Vec::new();
        for child in self.children() {
            child.walk(&mut all);
        }
        all.into_iter().map(|s| s.name.clone()).collect()
    }
}

/// Closed set of step kinds with their type-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Deterministic handler call, optionally delegated to an agent.
    Python {
        /// Handler registry key.
        action: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
        /// JSON Schema the step's output must satisfy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
    },
    /// Direct agent delegation with a prompt.
    Agent {
        prompt: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
    },
    /// Text generation through the agent; output is always a string.
    Generate {
        prompt: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
    },
    /// Named validation stages run by the stage runner.
    Validate {
        stages: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
    },
    /// Bounded concurrent fan-out over child steps.
    Parallel {
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
    },
    /// Conditional selection of one of two step lists.
    Branch {
        condition: String,
        then: Vec<StepDefinition>,
        #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<StepDefinition>,
    },
    /// Runs its body once per element of `items`.
    Loop {
        /// Expression that must evaluate to a list.
        items: String,
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
    },
    /// Flushes the checkpoint store.
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Runs another workflow document in a fresh context.
    Subworkflow {
        /// Reference resolved by the workflow source (a relative path for files).
        workflow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Python { .. } => StepType::Python,
            StepKind::Agent { .. } => StepType::Agent,
            StepKind::Generate { .. } => StepType::Generate,
            StepKind::Validate { .. } => StepType::Validate,
            StepKind::Parallel { .. } => StepType::Parallel,
            StepKind::Branch { .. } => StepType::Branch,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Checkpoint { .. } => StepType::Checkpoint,
            StepKind::Subworkflow { .. } => StepType::Subworkflow,
        }
    }
}

/// Fieldless mirror of [`StepKind`] for reports and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Python,
    Agent,
    Generate,
    Validate,
    Parallel,
    Branch,
    Loop,
    Checkpoint,
    Subworkflow,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Python => "python",
            StepType::Agent => "agent",
            StepType::Generate => "generate",
            StepType::Validate => "validate",
            StepType::Parallel => "parallel",
            StepType::Branch => "branch",
            StepType::Loop => "loop",
            StepType::Checkpoint => "checkpoint",
            StepType::Subworkflow => "subworkflow",
        }
    }

    /// Control-flow steps only orchestrate other steps.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StepType::Parallel
                | StepType::Branch
                | StepType::Loop
                | StepType::Checkpoint
                | StepType::Subworkflow
        )
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step Config (mode / autonomy)
// ---------------------------------------------------------------------------

/// Per-step execution settings. Only `python` steps honour `mode` and
/// `autonomy`; other kinds ignore them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub mode: ExecutionMode,
    pub autonomy: AutonomyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_suffix: Option<String>,
    /// Path (relative to the workflow file) whose content is appended to the
    /// delegation request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
}

/// Deterministic handler vs agent delegation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Deterministic,
    Agent,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Deterministic => f.write_str("deterministic"),
            ExecutionMode::Agent => f.write_str("agent"),
        }
    }
}

/// Graduated trust in agent-produced results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Agent mode refused; the handler always runs.
    #[default]
    Operator,
    /// Handler re-does the step and its result wins.
    Collaborator,
    /// Agent result accepted; schema mismatches only warn.
    Consultant,
    /// Agent result accepted unless it hard-fails.
    Approver,
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AutonomyLevel::Operator => "operator",
            AutonomyLevel::Collaborator => "collaborator",
            AutonomyLevel::Consultant => "consultant",
            AutonomyLevel::Approver => "approver",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
