#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_core::workflow::collaborator::{
    AgentError, StageError, StageReport, StageRunner, StepExecutor,
};
use stepwise_core::workflow::definition::parse_workflow_yaml;
use stepwise_core::workflow::handler::{
    FnHandler, HandlerError, HandlerInput, HandlerRegistry, StepHandler,
};
use stepwise_types::delegation::DelegationRequest;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::WorkflowDefinition;

pub fn workflow(yaml: &str) -> WorkflowDefinition {
    parse_workflow_yaml(yaml).expect("workflow should parse")
}

pub fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Handler returning its resolved inputs, recording each invocation.
pub fn echo(calls: Arc<Mutex<Vec<String>>>) -> impl StepHandler + 'static {
    FnHandler::new(move |input: HandlerInput| {
        let calls = Arc::clone(&calls);
        let fut: BoxFuture<'static, Result<Value, HandlerError>> = Box::pin(async move {
            calls.lock().unwrap().push(input.step.clone());
            Ok(input.inputs)
        });
        fut
    })
}

pub fn registry_with_echo() -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.register("echo", echo(Arc::clone(&calls)));
    (registry, calls)
}

/// Step executor that answers every request the same way.
pub struct ScriptedAgent {
    response: Result<Value, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<DelegationRequest>>,
}

impl ScriptedAgent {
    pub fn returning(value: Value) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(value),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Err(message.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(value: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(value),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DelegationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl StepExecutor for ScriptedAgent {
    fn execute(&self, request: DelegationRequest) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.response.clone().map_err(AgentError::Failed)
        })
    }
}

/// Stage runner with a fixed pass/fail table.
pub struct TableStages {
    pub results: BTreeMap<String, bool>,
}

impl StageRunner for TableStages {
    fn run_stage<'a>(
        &'a self,
        stage: &'a str,
        _inputs: &'a Value,
    ) -> BoxFuture<'a, Result<StageReport, StageError>> {
        Box::pin(async move {
            let passed = *self
                .results
                .get(stage)
                .ok_or_else(|| StageError::UnknownStage(stage.to_string()))?;
            Ok(StageReport {
                stage: stage.to_string(),
                passed,
                detail: if passed { String::new() } else { format!("{stage} reported errors") },
            })
        })
    }
}

pub fn has_event(trace: &[WorkflowEvent], pred: impl Fn(&WorkflowEvent) -> bool) -> bool {
    trace.iter().any(pred)
}
