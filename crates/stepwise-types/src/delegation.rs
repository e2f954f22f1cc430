//! Delegation request sent to the external step executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::StepType;

/// What an agent receives when a step is delegated to it.
///
/// `intent` states what the step accomplishes, never how; the agent decides
/// the approach. Prompt construction is the executor's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub run_id: Uuid,
    pub step: String,
    pub step_type: StepType,
    /// Handler action for `python` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub intent: String,
    /// Fully resolved step inputs.
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_suffix: Option<String>,
    /// Content of the step's `prompt_file`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
    /// Declared output contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Set while the request originates from a workflow run rather than an
    /// interactive session.
    #[serde(default)]
    pub workflow_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_fields_are_omitted() {
        let request = DelegationRequest {
            run_id: Uuid::nil(),
            step: "create_branch".to_string(),
            step_type: StepType::Python,
            action: Some("create_branch".to_string()),
            intent: "Create a git branch with the requested name".to_string(),
            inputs: json!({ "name": "feat-x" }),
            prompt_suffix: None,
            prompt_file: None,
            output_schema: None,
            workflow_active: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("prompt_suffix").is_none());
        assert!(value.get("output_schema").is_none());
        assert_eq!(value["step_type"], json!("python"));
        assert_eq!(value["workflow_active"], json!(true));
    }
}
