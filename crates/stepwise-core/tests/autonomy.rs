mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use stepwise_core::workflow::checkpoint::MemoryCheckpointStore;
use stepwise_core::workflow::handler::{FnHandler, HandlerError, HandlerInput, HandlerRegistry};
use stepwise_core::workflow::{Dispatcher, RunOptions};
use stepwise_types::error::{ErrorKind, FallbackOutcome, FallbackReason};
use stepwise_types::event::{GateDecision, WorkflowEvent};
use stepwise_types::workflow::ExecutionMode;

use common::{ScriptedAgent, has_event, inputs, workflow};

const BRANCH_STEP: &str = r#"
name: branching
version: "0.1.0"
inputs:
  branch_name:
    type: string
steps:
  - name: create_branch
    type: python
    action: create_branch
    mode: agent
    autonomy: AUTONOMY
    inputs:
      name: "{{ inputs.branch_name }}"
SCHEMA"#;

const SCHEMA: &str = r#"    output_schema:
      type: string
      pattern: "^feat-"
"#;

fn branch_workflow(
    autonomy: &str,
    with_schema: bool,
) -> stepwise_types::workflow::WorkflowDefinition {
    let yaml = BRANCH_STEP
        .replace("AUTONOMY", autonomy)
        .replace("SCHEMA", if with_schema { SCHEMA } else { "" });
    workflow(&yaml)
}

type Proposals = Arc<Mutex<Vec<Option<Value>>>>;

/// Registry whose `create_branch` handler returns the requested name and
/// records the proposal it was handed.
fn branch_registry(with_intent: bool) -> (HandlerRegistry, Proposals) {
    let proposals: Proposals = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&proposals);
    let handler = FnHandler::new(move |input: HandlerInput| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(input.proposal.clone());
            Ok::<_, HandlerError>(input.inputs["name"].clone())
        }
    });
    let mut registry = HandlerRegistry::new();
    if with_intent {
        registry.register(
            "create_branch",
            handler.with_intent("Create a git branch for the change"),
        );
    } else {
        registry.register("create_branch", handler);
    }
    (registry, proposals)
}

fn feat_x() -> BTreeMap<String, Value> {
    inputs(&[("branch_name", json!("feat-x"))])
}

fn fallback_reason(trace: &[WorkflowEvent]) -> Option<(FallbackReason, bool)> {
    trace.iter().find_map(|e| match e {
        WorkflowEvent::FallbackOccurred { reason, succeeded, .. } => Some((*reason, *succeeded)),
        _ => None,
    })
}

fn gate_decision(trace: &[WorkflowEvent]) -> Option<GateDecision> {
    trace.iter().find_map(|e| match e {
        WorkflowEvent::AutonomyDecision { decision, .. } => Some(*decision),
        _ => None,
    })
}

#[tokio::test]
async fn test_collaborator_handler_output_wins() {
    let (registry, proposals) = branch_registry(true);
    let agent = ScriptedAgent::returning(json!("feature-x"));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();
    let store = MemoryCheckpointStore::new();

    let outcome = dispatcher
        .run(
            &branch_workflow("collaborator", false),
            feat_x(),
            RunOptions::with_checkpoint(store.clone()),
        )
        .await
        .unwrap();

    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert_eq!(agent.calls(), 1);
    assert_eq!(*proposals.lock().unwrap(), vec![Some(json!("feature-x"))]);

    let (reason, succeeded) = fallback_reason(&outcome.trace).unwrap();
    assert_eq!(reason.as_str(), "collaborator_validation_used_handler");
    assert!(succeeded);
    assert_eq!(gate_decision(&outcome.trace), Some(GateDecision::HandlerAuthoritative));

    let record = store.record().unwrap();
    assert!(record.entries["create_branch"].fallback);
}

#[tokio::test]
async fn test_operator_refuses_agent_mode() {
    let (registry, proposals) = branch_registry(true);
    let agent = ScriptedAgent::returning(json!("feature-x"));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("operator", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(agent.calls(), 0);
    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert_eq!(*proposals.lock().unwrap(), vec![None]);
    assert!(has_event(&outcome.trace, |e| matches!(
        e,
        WorkflowEvent::ModeSelected {
            requested: ExecutionMode::Agent,
            selected: ExecutionMode::Deterministic,
            forced: Some(_),
            ..
        }
    )));
    assert_eq!(gate_decision(&outcome.trace), Some(GateDecision::Refused));
    assert!(fallback_reason(&outcome.trace).is_none());
}

#[tokio::test]
async fn test_consultant_accepts_schema_mismatch_with_warning() {
    let (registry, proposals) = branch_registry(true);
    let agent = ScriptedAgent::returning(json!("feature-x"));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("consultant", true), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(outcome.step_outputs["create_branch"], json!("feature-x"));
    assert!(proposals.lock().unwrap().is_empty());
    assert_eq!(gate_decision(&outcome.trace), Some(GateDecision::AcceptedWithWarning));
    assert!(has_event(&outcome.trace, |e| matches!(
        e,
        WorkflowEvent::SchemaMismatch { violations, .. } if !violations.is_empty()
    )));
}

#[tokio::test]
async fn test_approver_falls_back_on_schema_violation() {
    let (registry, proposals) = branch_registry(true);
    let agent = ScriptedAgent::returning(json!("feature-x"));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("approver", true), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert_eq!(*proposals.lock().unwrap(), vec![None]);
    assert_eq!(
        fallback_reason(&outcome.trace),
        Some((FallbackReason::SchemaViolation, true))
    );
}

#[tokio::test]
async fn test_approver_accepts_conforming_agent_result() {
    let (registry, proposals) = branch_registry(true);
    let agent = ScriptedAgent::returning(json!("feat-y"));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("approver", true), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-y"));
    assert!(proposals.lock().unwrap().is_empty());
    assert_eq!(gate_decision(&outcome.trace), Some(GateDecision::Accepted));

    let request = &agent.requests()[0];
    assert_eq!(request.step, "create_branch");
    assert_eq!(request.action.as_deref(), Some("create_branch"));
    assert_eq!(request.intent, "Create a git branch for the change");
    assert_eq!(request.inputs, json!({ "name": "feat-x" }));
    assert!(request.workflow_active);
    assert!(request.output_schema.is_some());
}

#[tokio::test]
async fn test_agent_error_falls_back_once() {
    let (registry, _) = branch_registry(true);
    let agent = ScriptedAgent::failing("model overloaded");
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("approver", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(agent.calls(), 1);
    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert_eq!(fallback_reason(&outcome.trace), Some((FallbackReason::AgentError, true)));
}

#[tokio::test(start_paused = true)]
async fn test_agent_timeout_falls_back_with_timeout_reason() {
    let (registry, _) = branch_registry(true);
    let agent = ScriptedAgent::slow(json!("feat-late"), Duration::from_secs(600));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("consultant", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert_eq!(fallback_reason(&outcome.trace), Some((FallbackReason::AgentTimeout, true)));
}

#[tokio::test]
async fn test_missing_executor_uses_handler() {
    let (registry, _) = branch_registry(true);
    let dispatcher = Dispatcher::builder(registry).build();

    let outcome = dispatcher
        .run(&branch_workflow("approver", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();
    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert_eq!(fallback_reason(&outcome.trace), Some((FallbackReason::AgentError, true)));
}

#[tokio::test]
async fn test_agent_error_without_handler_fails() {
    let mut registry = HandlerRegistry::new();
    registry.describe("create_branch", "Create a git branch for the change");
    let agent = ScriptedAgent::failing("model overloaded");
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let err = dispatcher
        .run(&branch_workflow("approver", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.kind, ErrorKind::AgentExecutionError);
    assert_eq!(
        report.fallback,
        Some(FallbackOutcome {
            attempted: false,
            succeeded: false
        })
    );
}

#[tokio::test]
async fn test_failed_fallback_reports_both_attempts() {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "create_branch",
        FnHandler::new(|_: HandlerInput| async {
            Err::<Value, _>(HandlerError::Failed("branch already exists".to_string()))
        })
        .with_intent("Create a git branch for the change"),
    );
    let agent = ScriptedAgent::failing("model overloaded");
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let err = dispatcher
        .run(&branch_workflow("approver", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.kind, ErrorKind::HandlerFailure);
    assert!(report.message.contains("branch already exists"));
    assert!(report.message.contains("model overloaded"));
    assert_eq!(
        report.fallback,
        Some(FallbackOutcome {
            attempted: true,
            succeeded: false
        })
    );
    assert_eq!(fallback_reason(err.trace()), Some((FallbackReason::AgentError, false)));
}

#[tokio::test]
async fn test_action_without_intent_is_forced_deterministic() {
    let (registry, _) = branch_registry(false);
    let agent = ScriptedAgent::returning(json!("feature-x"));
    let dispatcher = Dispatcher::builder(registry).executor(agent.clone()).build();

    let outcome = dispatcher
        .run(&branch_workflow("approver", false), feat_x(), RunOptions::ephemeral())
        .await
        .unwrap();

    assert_eq!(agent.calls(), 0);
    assert_eq!(outcome.step_outputs["create_branch"], json!("feat-x"));
    assert!(has_event(&outcome.trace, |e| matches!(
        e,
        WorkflowEvent::ModeSelected { forced: Some(why), .. } if why.contains("no intent")
    )));
}

#[tokio::test]
async fn test_agent_step_delegates_rendered_prompt() {
    let agent = ScriptedAgent::returning(json!({ "title": "Add retries" }));
    let dispatcher = Dispatcher::builder(HandlerRegistry::new())
        .executor(agent.clone())
        .build();
    let def = workflow(
        r#"
name: describe
version: "0.1.0"
inputs:
  branch_name:
    type: string
steps:
  - name: draft
    type: agent
    prompt: "Write a PR title for {{ inputs.branch_name }}"
    prompt_suffix: "Keep it under {{ 60 }} characters"
    output_schema:
      type: object
      required: [title]
"#,
    );

    let outcome = dispatcher.run(&def, feat_x(), RunOptions::ephemeral()).await.unwrap();

    assert_eq!(outcome.step_outputs["draft"], json!({ "title": "Add retries" }));
    let request = &agent.requests()[0];
    assert_eq!(request.intent, "Write a PR title for feat-x");
    assert_eq!(request.action, None);
    assert_eq!(request.prompt_suffix.as_deref(), Some("Keep it under 60 characters"));
}

#[tokio::test]
async fn test_agent_step_schema_violation_fails() {
    let agent = ScriptedAgent::returning(json!({ "headline": "nope" }));
    let dispatcher = Dispatcher::builder(HandlerRegistry::new())
        .executor(agent.clone())
        .build();
    let def = workflow(
        r#"
name: describe
version: "0.1.0"
steps:
  - name: draft
    type: agent
    prompt: "Write a PR title"
    output_schema:
      type: object
      required: [title]
"#,
    );

    let err = dispatcher
        .run(&def, BTreeMap::new(), RunOptions::ephemeral())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutputSchemaViolation);
    assert!(err.report().unwrap().fallback.is_none());
}

#[tokio::test]
async fn test_generate_step_output_is_text() {
    let agent = ScriptedAgent::returning(json!({ "b": 2, "a": 1 }));
    let dispatcher = Dispatcher::builder(HandlerRegistry::new())
        .executor(agent.clone())
        .build();
    let def = workflow(
        "name: gen\nversion: \"0.1.0\"\nsteps:\n  - name: notes\n    type: generate\n    prompt: Release notes\n",
    );

    let outcome = dispatcher
        .run(&def, BTreeMap::new(), RunOptions::ephemeral())
        .await
        .unwrap();
    assert_eq!(outcome.step_outputs["notes"], json!(r#"{"a":1,"b":2}"#));
}

#[tokio::test]
async fn test_agent_step_without_executor_is_dispatch_error() {
    let dispatcher = Dispatcher::builder(HandlerRegistry::new()).build();
    let def = workflow(
        "name: gen\nversion: \"0.1.0\"\nsteps:\n  - name: notes\n    type: generate\n    prompt: Release notes\n",
    );

    let err = dispatcher
        .run(&def, BTreeMap::new(), RunOptions::ephemeral())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StepDispatchError);
}
