//! Mode-aware step dispatcher: the engine's control loop.
//!
//! Walks a workflow's steps in order, evaluates guards and inputs against
//! the execution context, runs each step (deterministic handler, agent
//! delegation through the autonomy gate, or one of the control-flow kinds),
//! records outputs in the context and the checkpoint, and publishes a
//! `WorkflowEvent` for every decision.
//!
//! Parallel fan-out lives in `parallel.rs` as a second `impl Dispatcher`
//! block.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use stepwise_types::config::EngineConfig;
use stepwise_types::delegation::DelegationRequest;
use stepwise_types::error::{ErrorKind, FailureReport, FallbackReason};
use stepwise_types::event::{GateDecision, SkipReason, WorkflowEvent};
use stepwise_types::workflow::{
    AutonomyLevel, ExecutionMode, StepDefinition, StepKind, StepType, WorkflowDefinition,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
use super::collaborator::{StageError, StageRunner, StepExecutor, WorkflowSource};
use super::context::{ExecutionContext, SlotLayout};
use super::definition::{DefinitionError, resolve_inputs, validate_definition};
use super::expression::{Condition, Evaluator, SlotValue, canonical_string};
use super::gate::{self, AgentAttempt, GateVerdict};
use super::handler::{HandlerInput, HandlerRegistry, StepHandler};
use super::schema::SchemaCache;
use crate::event::{EventBus, EventSubscription};

/// Maximum nesting of subworkflow steps.
pub const MAX_SUBWORKFLOW_DEPTH: usize = 5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Knobs for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bound on handlers, validation stages and subworkflow loads.
    pub step_timeout: Duration,
    /// Bound on agent delegation.
    pub agent_timeout: Duration,
    pub default_max_concurrent: usize,
    /// Resolve and trace decisions without running anything.
    pub dry_run: bool,
    /// Forwarded in every delegation request.
    pub workflow_active: bool,
    /// Directory `prompt_file` paths are relative to.
    pub base_dir: PathBuf,
    pub max_subworkflow_depth: usize,
}

impl DispatcherConfig {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            step_timeout: Duration::from_secs(config.default_step_timeout_secs),
            agent_timeout: Duration::from_secs(config.agent_timeout_secs),
            default_max_concurrent: config.default_max_concurrent.max(1),
            dry_run: false,
            workflow_active: true,
            base_dir: PathBuf::from("."),
            max_subworkflow_depth: MAX_SUBWORKFLOW_DEPTH,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_engine_config(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Run options and results
// ---------------------------------------------------------------------------

/// Per-run options.
pub struct RunOptions<S> {
    /// Store to resume from and append to. `None` runs without checkpoints.
    pub checkpoint: Option<S>,
    /// Ignore any existing checkpoint and start over.
    pub fresh: bool,
    pub cancel: CancellationToken,
    pub run_id: Option<Uuid>,
    pub dry_run: bool,
}

impl<S> RunOptions<S> {
    pub fn with_checkpoint(store: S) -> Self {
        Self {
            checkpoint: Some(store),
            fresh: false,
            cancel: CancellationToken::new(),
            run_id: None,
            dry_run: false,
        }
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

impl RunOptions<MemoryCheckpointStore> {
    /// Run without checkpointing.
    pub fn ephemeral() -> Self {
        Self {
            checkpoint: None,
            fresh: false,
            cancel: CancellationToken::new(),
            run_id: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    /// Dry run finished.
    Planned,
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    /// Evaluated output bindings (empty when cancelled).
    pub outputs: BTreeMap<String, Value>,
    /// Every ready step output, keyed by step name.
    pub step_outputs: BTreeMap<String, Value>,
    pub completed_steps: Vec<String>,
    /// Steps skipped because the checkpoint already had them.
    pub restored_steps: Vec<String>,
    pub duration_ms: u64,
    /// Decision trace, in emission order.
    pub trace: Vec<WorkflowEvent>,
}

/// Why a run did not produce an outcome.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("{report}")]
    StepFailed {
        report: Box<FailureReport>,
        run_id: Uuid,
        trace: Vec<WorkflowEvent>,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Definition(_) => ErrorKind::DefinitionError,
            EngineError::Checkpoint(e) => e.kind(),
            EngineError::StepFailed { report, .. } => report.kind,
        }
    }

    pub fn report(&self) -> Option<&FailureReport> {
        match self {
            EngineError::StepFailed { report, .. } => Some(report),
            _ => None,
        }
    }

    pub fn trace(&self) -> &[WorkflowEvent] {
        match self {
            EngineError::StepFailed { trace, .. } => trace,
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Internal run state
// ---------------------------------------------------------------------------

/// Why dispatch stopped early.
pub(crate) enum Halt {
    Cancelled,
    Failed(Box<FailureReport>),
}

impl From<Box<FailureReport>> for Halt {
    fn from(report: Box<FailureReport>) -> Self {
        Halt::Failed(report)
    }
}

/// What a step's body produced.
pub(crate) enum Produced {
    Value { output: Value, fallback: bool },
    /// Dry run: the slot gets a placeholder.
    Planned,
}

impl Produced {
    pub(crate) fn value(output: Value) -> Self {
        Produced::Value {
            output,
            fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Completed,
    Restored,
    Skipped,
}

/// Lexical position of a step list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    /// Loop bodies and subworkflows are not checkpointed individually.
    pub checkpointing: bool,
    pub depth: usize,
}

impl Frame {
    fn top() -> Self {
        Self {
            checkpointing: true,
            depth: 0,
        }
    }
}

pub(crate) struct RunState<S: CheckpointStore> {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub checkpoint: Option<CheckpointManager<S>>,
    pub restored: HashSet<String>,
    pub cancel: CancellationToken,
    trace: Mutex<Vec<WorkflowEvent>>,
}

impl<S: CheckpointStore> RunState<S> {
    fn take_trace(&self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut *self.trace.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

fn report(step: &StepDefinition, kind: ErrorKind, message: impl Into<String>) -> FailureReport {
    FailureReport::new(&step.name, Some(step.step_type()), kind, message)
}

pub(crate) fn failure(
    step: &StepDefinition,
    kind: ErrorKind,
    message: impl Into<String>,
) -> Box<FailureReport> {
    Box::new(report(step, kind, message))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Inner {
    registry: HandlerRegistry,
    executor: Option<Arc<dyn StepExecutor>>,
    stages: Option<Arc<dyn StageRunner>>,
    workflows: Option<Arc<dyn WorkflowSource>>,
    events: EventBus,
    evaluator: Evaluator,
    schemas: SchemaCache,
    config: DispatcherConfig,
}

/// Executes workflow definitions. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Builder for [`Dispatcher`]; collaborators are optional.
pub struct DispatcherBuilder {
    registry: HandlerRegistry,
    executor: Option<Arc<dyn StepExecutor>>,
    stages: Option<Arc<dyn StageRunner>>,
    workflows: Option<Arc<dyn WorkflowSource>>,
    events: Option<EventBus>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn stage_runner(mut self, stages: Arc<dyn StageRunner>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn workflow_source(mut self, source: Arc<dyn WorkflowSource>) -> Self {
        self.workflows = Some(source);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                registry: self.registry,
                executor: self.executor,
                stages: self.stages,
                workflows: self.workflows,
                events: self.events.unwrap_or_default(),
                evaluator: Evaluator::new(),
                schemas: SchemaCache::new(),
                config: self.config,
            }),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.inner.registry)
            .field("has_executor", &self.inner.executor.is_some())
            .field("has_stage_runner", &self.inner.stages.is_some())
            .field("has_workflow_source", &self.inner.workflows.is_some())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Dispatcher {
    pub fn builder(registry: HandlerRegistry) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            executor: None,
            stages: None,
            workflows: None,
            events: None,
            config: DispatcherConfig::default(),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Dry run: resolve expressions and trace dispatch decisions without
    /// invoking handlers, agents, stages or subworkflows.
    pub async fn plan(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> Result<RunOutcome, EngineError> {
        self.run(def, inputs, RunOptions::ephemeral().dry_run()).await
    }

    /// Execute a workflow to completion, cancellation, or the first failure.
    pub async fn run<S: CheckpointStore + 'static>(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
        options: RunOptions<S>,
    ) -> Result<RunOutcome, EngineError> {
        validate_definition(def)?;
        let inputs = resolve_inputs(def, inputs)?;
        let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);
        let dry_run = options.dry_run || self.inner.config.dry_run;
        let layout = Arc::new(SlotLayout::for_definition(def));
        let mut ctx = ExecutionContext::new(Arc::clone(&layout), inputs.clone());

        let checkpoint = match options.checkpoint {
            Some(store) if options.fresh => {
                Some(CheckpointManager::start(store, &def.name, run_id, &inputs))
            }
            Some(store) => {
                Some(CheckpointManager::resume(store, &def.name, run_id, &layout, &inputs).await?)
            }
            None => None,
        };

        let mut restored = HashSet::new();
        let mut restored_steps = Vec::new();
        if let Some(manager) = &checkpoint {
            let loops: HashMap<&str, &StepDefinition> = def
                .all_steps()
                .into_iter()
                .filter(|s| s.step_type() == StepType::Loop)
                .map(|s| (s.name.as_str(), s))
                .collect();
            for (name, entry) in manager.restored() {
                let corrupted = |reason: String| CheckpointError::Corrupted {
                    location: manager.location(),
                    reason,
                };
                ctx.set_output(name, entry.output.clone())
                    .map_err(|e| corrupted(e.to_string()))?;
                if let Some(step) = loops.get(name.as_str()) {
                    restore_loop_body(step, &entry.output, &mut ctx).map_err(corrupted)?;
                }
                restored.insert(name.clone());
                restored_steps.push(name.clone());
            }
        }

        let state = Arc::new(RunState {
            run_id,
            dry_run,
            checkpoint,
            restored,
            cancel: options.cancel,
            trace: Mutex::new(Vec::new()),
        });
        let started = Instant::now();

        if restored_steps.is_empty() {
            self.emit(
                &state,
                WorkflowEvent::RunStarted {
                    run_id,
                    workflow: def.name.clone(),
                    dry_run,
                },
            );
        } else {
            self.emit(
                &state,
                WorkflowEvent::RunResumed {
                    run_id,
                    workflow: def.name.clone(),
                    restored_steps: restored_steps.len(),
                },
            );
        }

        let result = match self.execute_steps(&def.steps, &mut ctx, &state, Frame::top()).await {
            Ok(()) => self.bind_outputs(def, &ctx).map_err(Halt::Failed),
            Err(halt) => Err(halt),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = |status, outputs, trace| RunOutcome {
            run_id,
            workflow: def.name.clone(),
            status,
            outputs,
            step_outputs: ctx.outputs_snapshot(),
            completed_steps: ctx.completed_names().into_iter().map(str::to_string).collect(),
            restored_steps: restored_steps.clone(),
            duration_ms,
            trace,
        };

        match result {
            Ok(outputs) => {
                self.emit(
                    &state,
                    WorkflowEvent::RunCompleted {
                        run_id,
                        workflow: def.name.clone(),
                        duration_ms,
                        steps_completed: ctx.completed_names().len(),
                    },
                );
                let status = if dry_run {
                    RunStatus::Planned
                } else {
                    RunStatus::Completed
                };
                Ok(outcome(status, outputs, state.take_trace()))
            }
            Err(Halt::Cancelled) => {
                self.emit(
                    &state,
                    WorkflowEvent::RunCancelled {
                        run_id,
                        workflow: def.name.clone(),
                    },
                );
                Ok(outcome(RunStatus::Cancelled, BTreeMap::new(), state.take_trace()))
            }
            Err(Halt::Failed(report)) => {
                self.emit(
                    &state,
                    WorkflowEvent::RunFailed {
                        run_id,
                        workflow: def.name.clone(),
                        step: report.step.clone(),
                        kind: report.kind,
                    },
                );
                Err(EngineError::StepFailed {
                    report,
                    run_id,
                    trace: state.take_trace(),
                })
            }
        }
    }

    /// Evaluate a definition's output bindings against a finished context.
    fn bind_outputs(
        &self,
        def: &WorkflowDefinition,
        ctx: &ExecutionContext,
    ) -> Result<BTreeMap<String, Value>, Box<FailureReport>> {
        let mut outputs = BTreeMap::new();
        for (name, template) in &def.outputs {
            let value = self.inner.evaluator.render(template, ctx).map_err(|e| {
                Box::new(FailureReport::new(
                    format!("outputs.{name}"),
                    None,
                    ErrorKind::EvaluationError,
                    e.to_string(),
                ))
            })?;
            outputs.insert(name.clone(), value);
        }
        Ok(outputs)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub(crate) fn emit<S: CheckpointStore>(&self, state: &RunState<S>, event: WorkflowEvent) {
        log_event(&event);
        state
            .trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        self.inner.events.publish(event);
    }

    // -----------------------------------------------------------------------
    // Step sequencing
    // -----------------------------------------------------------------------

    pub(crate) fn execute_steps<'a, S: CheckpointStore + 'static>(
        &'a self,
        steps: &'a [StepDefinition],
        ctx: &'a mut ExecutionContext,
        state: &'a Arc<RunState<S>>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<(), Halt>> {
        Box::pin(async move {
            for step in steps {
                self.execute_step(step, &mut *ctx, state, frame).await?;
            }
            Ok(())
        })
    }

    /// Run one step: cancellation and checkpoint checks, guard, dispatch,
    /// slot write and checkpoint append.
    pub(crate) fn execute_step<'a, S: CheckpointStore + 'static>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a mut ExecutionContext,
        state: &'a Arc<RunState<S>>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<Disposition, Halt>> {
        Box::pin(async move {
            let result = self.step_lifecycle(step, ctx, state, frame).await;
            if let Err(Halt::Failed(report)) = &result {
                if report.step == step.name {
                    self.emit(
                        state,
                        WorkflowEvent::StepFailed {
                            run_id: state.run_id,
                            step: step.name.clone(),
                            kind: report.kind,
                            error: report.message.clone(),
                        },
                    );
                }
            }
            result
        })
    }

    async fn step_lifecycle<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        ctx: &mut ExecutionContext,
        state: &Arc<RunState<S>>,
        frame: Frame,
    ) -> Result<Disposition, Halt> {
        if state.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        if frame.checkpointing && state.restored.contains(&step.name) {
            self.emit(
                state,
                WorkflowEvent::StepSkipped {
                    run_id: state.run_id,
                    step: step.name.clone(),
                    reason: SkipReason::Checkpointed,
                },
            );
            return Ok(Disposition::Restored);
        }

        if let Some(when) = &step.when {
            let condition = self
                .inner
                .evaluator
                .condition(when, &*ctx)
                .map_err(|e| failure(step, ErrorKind::EvaluationError, e.to_string()))?;
            if condition == Condition::False {
                self.emit(
                    state,
                    WorkflowEvent::StepSkipped {
                        run_id: state.run_id,
                        step: step.name.clone(),
                        reason: SkipReason::Guard,
                    },
                );
                return Ok(Disposition::Skipped);
            }
        }

        self.emit(
            state,
            WorkflowEvent::StepStarted {
                run_id: state.run_id,
                step: step.name.clone(),
                step_type: step.step_type(),
            },
        );
        let started = Instant::now();

        let produced = self.dispatch(step, &mut *ctx, state, frame).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let fallback = match produced {
            Produced::Planned => {
                ctx.mark_planned(&step.name)
                    .map_err(|e| failure(step, ErrorKind::StepDispatchError, e.to_string()))?;
                false
            }
            Produced::Value { output, fallback } => {
                if frame.checkpointing && !state.dry_run {
                    if let Some(manager) = &state.checkpoint {
                        let sequence = manager
                            .append(&step.name, &output, fallback)
                            .await
                            .map_err(|e| failure(step, e.kind(), e.to_string()))?;
                        self.emit(
                            state,
                            WorkflowEvent::CheckpointWritten {
                                run_id: state.run_id,
                                step: step.name.clone(),
                                sequence,
                            },
                        );
                    }
                }
                ctx.set_output(&step.name, output)
                    .map_err(|e| failure(step, ErrorKind::StepDispatchError, e.to_string()))?;
                fallback
            }
        };

        self.emit(
            state,
            WorkflowEvent::StepCompleted {
                run_id: state.run_id,
                step: step.name.clone(),
                duration_ms,
                fallback,
            },
        );
        Ok(Disposition::Completed)
    }

    /// Exhaustive dispatch over step kinds.
    async fn dispatch<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        ctx: &mut ExecutionContext,
        state: &Arc<RunState<S>>,
        frame: Frame,
    ) -> Result<Produced, Halt> {
        if step.step_type() != StepType::Python && step.config.mode == ExecutionMode::Agent {
            tracing::warn!(
                step = %step.name,
                step_type = %step.step_type(),
                "mode: agent only applies to python steps; running deterministically"
            );
            self.emit(
                state,
                WorkflowEvent::ModeSelected {
                    run_id: state.run_id,
                    step: step.name.clone(),
                    requested: ExecutionMode::Agent,
                    selected: ExecutionMode::Deterministic,
                    forced: Some(format!("{} steps have no intent", step.step_type())),
                },
            );
        }

        match &step.kind {
            StepKind::Python {
                action,
                inputs,
                output_schema,
            } => Ok(self
                .run_python(step, action, inputs, output_schema.as_ref(), ctx, state)
                .await?),
            StepKind::Agent {
                prompt,
                inputs,
                output_schema,
            } => Ok(self
                .run_prompted(step, prompt, inputs, output_schema.as_ref(), false, ctx, state)
                .await?),
            StepKind::Generate { prompt, inputs } => Ok(self
                .run_prompted(step, prompt, inputs, None, true, ctx, state)
                .await?),
            StepKind::Validate { stages, inputs } => {
                Ok(self.run_validate(step, stages, inputs, ctx, state).await?)
            }
            StepKind::Parallel {
                steps,
                max_concurrent,
            } => {
                self.run_parallel(step, steps, *max_concurrent, ctx, state, frame)
                    .await
            }
            StepKind::Branch {
                condition,
                then,
                otherwise,
            } => {
                self.run_branch(step, condition, then, otherwise, ctx, state, frame)
                    .await
            }
            StepKind::Loop {
                items,
                steps,
                max_iterations,
            } => {
                self.run_loop(step, items, steps, *max_iterations, ctx, state, frame)
                    .await
            }
            StepKind::Checkpoint { label } => {
                Ok(self.run_checkpoint(step, label.as_deref(), ctx, state, frame).await?)
            }
            StepKind::Subworkflow { workflow, inputs } => {
                self.run_subworkflow(step, workflow, inputs, ctx, state, frame)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Python steps
    // -----------------------------------------------------------------------

    async fn run_python<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        action: &str,
        inputs: &BTreeMap<String, Value>,
        output_schema: Option<&Value>,
        ctx: &ExecutionContext,
        state: &RunState<S>,
    ) -> Result<Produced, Box<FailureReport>> {
        let resolved = self.resolve_step_inputs(step, inputs, ctx)?;
        let handler = self.inner.registry.get(action);

        match self.select_mode(step, action, state) {
            ExecutionMode::Deterministic => {
                let Some(handler) = handler else {
                    return Err(failure(
                        step,
                        ErrorKind::StepDispatchError,
                        format!("no handler registered for action '{action}'"),
                    ));
                };
                if state.dry_run {
                    return Ok(Produced::Planned);
                }
                let input = handler_input(step, action, resolved, ctx, None);
                let output = self
                    .invoke_handler(step, &handler, input)
                    .await
                    .map_err(|(kind, message)| failure(step, kind, message))?;
                Ok(Produced::value(output))
            }
            ExecutionMode::Agent => {
                if state.dry_run {
                    return Ok(Produced::Planned);
                }
                self.run_delegated(step, action, resolved, output_schema, handler, ctx, state)
                    .await
            }
        }
    }

    /// Choose the execution mode for a python step and trace the choice.
    fn select_mode<S: CheckpointStore>(
        &self,
        step: &StepDefinition,
        action: &str,
        state: &RunState<S>,
    ) -> ExecutionMode {
        let requested = step.config.mode;
        let autonomy = step.config.autonomy;

        let (selected, forced) = match requested {
            ExecutionMode::Deterministic => (ExecutionMode::Deterministic, None),
            ExecutionMode::Agent if !gate::admits_agent(autonomy) => {
                tracing::warn!(
                    step = %step.name,
                    "operator autonomy refuses agent mode; running the deterministic handler"
                );
                (
                    ExecutionMode::Deterministic,
                    Some("operator autonomy refuses agent mode".to_string()),
                )
            }
            ExecutionMode::Agent if self.inner.registry.intent(action).is_none() => {
                tracing::warn!(
                    step = %step.name,
                    action,
                    "no intent registered for action; forcing deterministic execution"
                );
                (
                    ExecutionMode::Deterministic,
                    Some(format!("no intent registered for action '{action}'")),
                )
            }
            ExecutionMode::Agent => (ExecutionMode::Agent, None),
        };

        self.emit(
            state,
            WorkflowEvent::ModeSelected {
                run_id: state.run_id,
                step: step.name.clone(),
                requested,
                selected,
                forced,
            },
        );
        if requested == ExecutionMode::Agent && autonomy == AutonomyLevel::Operator {
            self.emit(
                state,
                WorkflowEvent::AutonomyDecision {
                    run_id: state.run_id,
                    step: step.name.clone(),
                    autonomy,
                    decision: GateDecision::Refused,
                },
            );
        }
        selected
    }

    /// Agent-mode python step: delegate, consult the gate, fall back once.
    #[allow(clippy::too_many_arguments)]
    async fn run_delegated<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        action: &str,
        inputs: Value,
        output_schema: Option<&Value>,
        handler: Option<Arc<dyn StepHandler>>,
        ctx: &ExecutionContext,
        state: &RunState<S>,
    ) -> Result<Produced, Box<FailureReport>> {
        let autonomy = step.config.autonomy;
        let intent = self.inner.registry.intent(action).unwrap_or_default();
        let attempt = self
            .delegate(
                step,
                Some(action.to_string()),
                intent,
                inputs.clone(),
                output_schema,
                ctx,
                state,
            )
            .await?;

        let verdict = gate::decide(
            autonomy,
            attempt,
            |value| match output_schema {
                Some(schema) => self.inner.schemas.check(schema, value),
                None => Ok(()),
            },
            handler.is_some(),
        );
        self.emit(
            state,
            WorkflowEvent::AutonomyDecision {
                run_id: state.run_id,
                step: step.name.clone(),
                autonomy,
                decision: verdict.decision(),
            },
        );

        match verdict {
            GateVerdict::Accept { value, violations } => {
                if !violations.is_empty() {
                    self.emit(
                        state,
                        WorkflowEvent::SchemaMismatch {
                            run_id: state.run_id,
                            step: step.name.clone(),
                            violations,
                        },
                    );
                }
                Ok(Produced::value(value))
            }
            GateVerdict::UseHandler {
                reason,
                proposal,
                agent_error,
            } => {
                let Some(handler) = handler else {
                    return Err(failure(
                        step,
                        ErrorKind::StepDispatchError,
                        format!("no handler registered for action '{action}'"),
                    ));
                };
                if let Some(error) = &agent_error {
                    tracing::warn!(
                        step = %step.name,
                        reason = %reason,
                        error = %error,
                        "agent attempt failed"
                    );
                }
                let input = handler_input(step, action, inputs, ctx, proposal);
                let result = self.invoke_handler(step, &handler, input).await;
                self.emit(
                    state,
                    WorkflowEvent::FallbackOccurred {
                        run_id: state.run_id,
                        step: step.name.clone(),
                        reason,
                        succeeded: result.is_ok(),
                    },
                );
                match result {
                    Ok(output) => Ok(Produced::Value {
                        output,
                        fallback: true,
                    }),
                    Err((kind, message)) => {
                        let message = match agent_error {
                            Some(agent) => format!("{message} (after agent failure: {agent})"),
                            None => message,
                        };
                        Err(Box::new(report(step, kind, message).with_fallback(true, false)))
                    }
                }
            }
            GateVerdict::Reject { kind, message } => {
                Err(Box::new(report(step, kind, message).with_fallback(false, false)))
            }
        }
    }

    /// Call the step executor under the agent timeout.
    ///
    /// Prompt-suffix evaluation errors are hard failures; everything that
    /// goes wrong on the agent side becomes a failed attempt.
    #[allow(clippy::too_many_arguments)]
    async fn delegate<S: CheckpointStore>(
        &self,
        step: &StepDefinition,
        action: Option<String>,
        intent: String,
        inputs: Value,
        output_schema: Option<&Value>,
        ctx: &ExecutionContext,
        state: &RunState<S>,
    ) -> Result<AgentAttempt, Box<FailureReport>> {
        let prompt_suffix = match &step.config.prompt_suffix {
            Some(template) => Some(
                self.inner
                    .evaluator
                    .render_string(template, ctx)
                    .map_err(|e| failure(step, ErrorKind::EvaluationError, e.to_string()))?,
            ),
            None => None,
        };

        let prompt_file = match &step.config.prompt_file {
            Some(relative) => {
                let path = self.inner.config.base_dir.join(relative);
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => Some(content),
                    Err(e) => {
                        return Ok(AgentAttempt::Failed {
                            reason: FallbackReason::AgentError,
                            error: format!("failed to read prompt_file {}: {e}", path.display()),
                        });
                    }
                }
            }
            None => None,
        };

        let Some(executor) = &self.inner.executor else {
            return Ok(AgentAttempt::Failed {
                reason: FallbackReason::AgentError,
                error: "no step executor is configured".to_string(),
            });
        };

        let request = DelegationRequest {
            run_id: state.run_id,
            step: step.name.clone(),
            step_type: step.step_type(),
            action,
            intent,
            inputs,
            prompt_suffix,
            prompt_file,
            output_schema: output_schema.cloned(),
            workflow_active: self.inner.config.workflow_active,
        };

        let limit = self.agent_timeout(step);
        Ok(match tokio::time::timeout(limit, executor.execute(request)).await {
            Err(_) => AgentAttempt::Failed {
                reason: FallbackReason::AgentTimeout,
                error: format!("agent timed out after {limit:?}"),
            },
            Ok(Err(e)) => AgentAttempt::Failed {
                reason: FallbackReason::AgentError,
                error: e.to_string(),
            },
            Ok(Ok(value)) => AgentAttempt::Succeeded(value),
        })
    }

    async fn invoke_handler(
        &self,
        step: &StepDefinition,
        handler: &Arc<dyn StepHandler>,
        input: HandlerInput,
    ) -> Result<Value, (ErrorKind, String)> {
        let limit = self.step_timeout(step);
        match tokio::time::timeout(limit, handler.run(input)).await {
            Err(_) => Err((ErrorKind::Timeout, format!("handler timed out after {limit:?}"))),
            Ok(Err(e)) => Err((ErrorKind::HandlerFailure, e.to_string())),
            Ok(Ok(value)) => Ok(value),
        }
    }

    // -----------------------------------------------------------------------
    // Agent / generate / validate steps
    // -----------------------------------------------------------------------

    /// `agent` and `generate` steps: direct delegation, no gate, no fallback.
    #[allow(clippy::too_many_arguments)]
    async fn run_prompted<S: CheckpointStore>(
        &self,
        step: &StepDefinition,
        prompt: &str,
        inputs: &BTreeMap<String, Value>,
        output_schema: Option<&Value>,
        as_text: bool,
        ctx: &ExecutionContext,
        state: &RunState<S>,
    ) -> Result<Produced, Box<FailureReport>> {
        let prompt = self
            .inner
            .evaluator
            .render_string(prompt, ctx)
            .map_err(|e| failure(step, ErrorKind::EvaluationError, e.to_string()))?;
        let resolved = self.resolve_step_inputs(step, inputs, ctx)?;
        if state.dry_run {
            return Ok(Produced::Planned);
        }
        if self.inner.executor.is_none() {
            return Err(failure(
                step,
                ErrorKind::StepDispatchError,
                format!("no step executor is configured for {} step", step.step_type()),
            ));
        }

        match self
            .delegate(step, None, prompt, resolved, output_schema, ctx, state)
            .await?
        {
            AgentAttempt::Failed { error, .. } => {
                Err(failure(step, ErrorKind::AgentExecutionError, error))
            }
            AgentAttempt::Succeeded(value) => {
                if let Some(schema) = output_schema {
                    if let Err(violations) = self.inner.schemas.check(schema, &value) {
                        return Err(failure(
                            step,
                            ErrorKind::OutputSchemaViolation,
                            format!(
                                "agent output violates the output schema: {}",
                                violations.join("; ")
                            ),
                        ));
                    }
                }
                let output = if as_text {
                    Value::String(canonical_string(&value))
                } else {
                    value
                };
                Ok(Produced::value(output))
            }
        }
    }

    async fn run_validate<S: CheckpointStore>(
        &self,
        step: &StepDefinition,
        stages: &[String],
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
        state: &RunState<S>,
    ) -> Result<Produced, Box<FailureReport>> {
        let resolved = self.resolve_step_inputs(step, inputs, ctx)?;
        if state.dry_run {
            return Ok(Produced::Planned);
        }
        let Some(runner) = &self.inner.stages else {
            return Err(failure(
                step,
                ErrorKind::StepDispatchError,
                "no validation stage runner is configured",
            ));
        };

        let limit = self.step_timeout(step);
        let mut reports = Vec::with_capacity(stages.len());
        for stage in stages {
            let attempt = tokio::time::timeout(limit, runner.run_stage(stage, &resolved)).await;
            let stage_report = match attempt {
                Err(_) => {
                    return Err(Box::new(
                        report(
                            step,
                            ErrorKind::Timeout,
                            format!("stage '{stage}' timed out after {limit:?}"),
                        )
                        .with_partial_output(to_json(&reports)),
                    ));
                }
                Ok(Err(e @ StageError::UnknownStage(_))) => {
                    return Err(failure(step, ErrorKind::StepDispatchError, e.to_string()));
                }
                Ok(Err(e)) => {
                    return Err(Box::new(
                        report(step, ErrorKind::ValidationFailure, e.to_string())
                            .with_partial_output(to_json(&reports)),
                    ));
                }
                Ok(Ok(r)) => r,
            };

            let passed = stage_report.passed;
            let detail = stage_report.detail.clone();
            reports.push(stage_report);
            if !passed {
                let message = if detail.is_empty() {
                    format!("stage '{stage}' failed")
                } else {
                    format!("stage '{stage}' failed: {detail}")
                };
                return Err(Box::new(
                    report(step, ErrorKind::ValidationFailure, message)
                        .with_partial_output(to_json(&reports)),
                ));
            }
        }

        Ok(Produced::value(json!({
            "passed": true,
            "stages": to_json(&reports),
        })))
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_branch<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        condition: &str,
        then: &[StepDefinition],
        otherwise: &[StepDefinition],
        ctx: &mut ExecutionContext,
        state: &Arc<RunState<S>>,
        frame: Frame,
    ) -> Result<Produced, Halt> {
        let condition = self
            .inner
            .evaluator
            .condition(condition, &*ctx)
            .map_err(|e| failure(step, ErrorKind::EvaluationError, e.to_string()))?;

        let met = match condition {
            Condition::Unknown => {
                // Plan both arms.
                self.execute_steps(then, &mut *ctx, state, frame).await?;
                self.execute_steps(otherwise, &mut *ctx, state, frame).await?;
                return Ok(Produced::Planned);
            }
            Condition::True => true,
            Condition::False => false,
        };

        let arm = if met { then } else { otherwise };
        self.execute_steps(arm, &mut *ctx, state, frame).await?;
        let selected: Vec<&str> = arm.iter().map(|s| s.name.as_str()).collect();
        Ok(Produced::value(json!({
            "condition_met": met,
            "selected": selected,
        })))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        items: &str,
        body: &[StepDefinition],
        max_iterations: Option<usize>,
        ctx: &mut ExecutionContext,
        state: &Arc<RunState<S>>,
        frame: Frame,
    ) -> Result<Produced, Halt> {
        let evaluated = self
            .inner
            .evaluator
            .evaluate_full(items, &*ctx)
            .map_err(|e| failure(step, ErrorKind::EvaluationError, e.to_string()))?;
        let body_names = step.descendant_names();
        let body_frame = Frame {
            checkpointing: false,
            ..frame
        };

        if evaluated.planned {
            ctx.rearm(&body_names);
            ctx.push_loop_frame(SlotValue::Planned, 0);
            let result = self.execute_steps(body, &mut *ctx, state, body_frame).await;
            ctx.pop_loop_frame();
            result?;
            return Ok(Produced::Planned);
        }

        let mut list = match evaluated.value {
            Value::Array(list) => list,
            other => {
                return Err(failure(
                    step,
                    ErrorKind::EvaluationError,
                    format!(
                        "loop items `{items}` must evaluate to a list, got {}",
                        canonical_string(&other)
                    ),
                )
                .into());
            }
        };
        if let Some(max) = max_iterations {
            if list.len() > max {
                tracing::warn!(
                    step = %step.name,
                    items = list.len(),
                    max_iterations = max,
                    "loop truncated to max_iterations"
                );
                list.truncate(max);
            }
        }

        let mut iterations = Vec::with_capacity(list.len());
        for (index, item) in list.into_iter().enumerate() {
            if state.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            ctx.rearm(&body_names);
            ctx.push_loop_frame(SlotValue::ready(item), index);
            let result = self.execute_steps(body, &mut *ctx, state, body_frame).await;
            ctx.pop_loop_frame();
            result?;

            let iteration: serde_json::Map<String, Value> = body_names
                .iter()
                .filter_map(|name| Some((name.clone(), ctx.output(name)?.clone())))
                .collect();
            iterations.push(Value::Object(iteration));
        }

        Ok(Produced::value(Value::Array(iterations)))
    }

    async fn run_checkpoint<S: CheckpointStore>(
        &self,
        step: &StepDefinition,
        label: Option<&str>,
        ctx: &ExecutionContext,
        state: &RunState<S>,
        frame: Frame,
    ) -> Result<Produced, Box<FailureReport>> {
        if frame.checkpointing && !state.dry_run {
            if let Some(manager) = &state.checkpoint {
                manager
                    .flush()
                    .await
                    .map_err(|e| failure(step, e.kind(), e.to_string()))?;
            }
        }
        Ok(Produced::value(json!({
            "label": label.unwrap_or(step.name.as_str()),
            "completed_steps": ctx.completed_names().len(),
        })))
    }

    async fn run_subworkflow<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        reference: &str,
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
        state: &Arc<RunState<S>>,
        frame: Frame,
    ) -> Result<Produced, Halt> {
        let depth = frame.depth + 1;
        let max = self.inner.config.max_subworkflow_depth;
        if depth > max {
            return Err(failure(
                step,
                ErrorKind::StepDispatchError,
                format!("subworkflow depth {depth} exceeds maximum {max}"),
            )
            .into());
        }
        let Some(source) = &self.inner.workflows else {
            return Err(failure(
                step,
                ErrorKind::StepDispatchError,
                "no workflow source is configured",
            )
            .into());
        };
        let resolved = self.resolve_step_inputs(step, inputs, ctx)?;
        if state.dry_run {
            return Ok(Produced::Planned);
        }

        let limit = self.step_timeout(step);
        let def = match tokio::time::timeout(limit, source.load(reference)).await {
            Err(_) => {
                return Err(failure(
                    step,
                    ErrorKind::Timeout,
                    format!("loading subworkflow '{reference}' timed out after {limit:?}"),
                )
                .into());
            }
            Ok(Err(e)) => {
                return Err(failure(
                    step,
                    ErrorKind::DefinitionError,
                    format!("subworkflow '{reference}': {e}"),
                )
                .into());
            }
            Ok(Ok(def)) => def,
        };

        let child_inputs = match resolved {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        let child_inputs = validate_definition(&def)
            .and_then(|()| resolve_inputs(&def, child_inputs))
            .map_err(|e| {
                failure(
                    step,
                    ErrorKind::DefinitionError,
                    format!("subworkflow '{reference}': {e}"),
                )
            })?;

        tracing::info!(
            run_id = %state.run_id,
            step = %step.name,
            workflow = %def.name,
            depth,
            "entering subworkflow"
        );

        let mut child_ctx =
            ExecutionContext::new(Arc::new(SlotLayout::for_definition(&def)), child_inputs);
        let child_frame = Frame {
            checkpointing: false,
            depth,
        };
        self.execute_steps(&def.steps, &mut child_ctx, state, child_frame)
            .await?;
        let outputs = self.bind_outputs(&def, &child_ctx)?;
        Ok(Produced::value(Value::Object(outputs.into_iter().collect())))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn resolve_step_inputs(
        &self,
        step: &StepDefinition,
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, Box<FailureReport>> {
        let raw = Value::Object(
            inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        self.inner
            .evaluator
            .resolve_value(&raw, ctx)
            .map_err(|e| failure(step, ErrorKind::EvaluationError, e.to_string()))
    }

    fn step_timeout(&self, step: &StepDefinition) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.inner.config.step_timeout)
    }

    fn agent_timeout(&self, step: &StepDefinition) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.inner.config.agent_timeout)
    }
}

fn handler_input(
    step: &StepDefinition,
    action: &str,
    inputs: Value,
    ctx: &ExecutionContext,
    proposal: Option<Value>,
) -> HandlerInput {
    HandlerInput {
        step: step.name.clone(),
        action: action.to_string(),
        inputs,
        context: ctx.clone(),
        proposal,
    }
}

/// Refill a restored loop's body slots from its last iteration, so later
/// steps see what an uninterrupted run would have left behind.
fn restore_loop_body(
    step: &StepDefinition,
    output: &Value,
    ctx: &mut ExecutionContext,
) -> Result<(), String> {
    let Some(last) = output.as_array().and_then(|iterations| iterations.last()) else {
        return Ok(());
    };
    let Value::Object(last) = last else {
        return Err(format!("loop '{}' has a malformed iteration record", step.name));
    };
    let body = step.descendant_names();
    for (name, value) in last {
        if !body.contains(name) {
            return Err(format!("'{name}' is not in the body of loop '{}'", step.name));
        }
        ctx.set_output(name, value.clone()).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Log an event with structured fields.
fn log_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted {
            run_id,
            workflow,
            dry_run,
        } => tracing::info!(
            run_id = %run_id,
            workflow = %workflow,
            dry_run,
            "workflow run started"
        ),
        WorkflowEvent::RunResumed {
            run_id,
            workflow,
            restored_steps,
        } => tracing::info!(
            run_id = %run_id,
            workflow = %workflow,
            restored_steps,
            "workflow run resumed from checkpoint"
        ),
        WorkflowEvent::StepStarted {
            run_id,
            step,
            step_type,
        } => tracing::debug!(
            run_id = %run_id,
            step = %step,
            step_type = %step_type,
            "step started"
        ),
        WorkflowEvent::StepSkipped {
            run_id,
            step,
            reason,
        } => tracing::info!(run_id = %run_id, step = %step, reason = ?reason, "step skipped"),
        WorkflowEvent::ModeSelected {
            run_id,
            step,
            requested,
            selected,
            forced,
        } => match forced {
            Some(why) => tracing::warn!(
                run_id = %run_id,
                step = %step,
                requested = %requested,
                selected = %selected,
                forced = %why,
                "execution mode forced"
            ),
            None => tracing::debug!(
                run_id = %run_id,
                step = %step,
                selected = %selected,
                "execution mode selected"
            ),
        },
        WorkflowEvent::AutonomyDecision {
            run_id,
            step,
            autonomy,
            decision,
        } => tracing::info!(
            run_id = %run_id,
            step = %step,
            autonomy = %autonomy,
            decision = ?decision,
            "autonomy gate decision"
        ),
        WorkflowEvent::FallbackOccurred {
            run_id,
            step,
            reason,
            succeeded,
        } => tracing::warn!(
            run_id = %run_id,
            step = %step,
            reason = %reason,
            succeeded,
            "fell back to deterministic handler"
        ),
        WorkflowEvent::SchemaMismatch {
            run_id,
            step,
            violations,
        } => tracing::warn!(
            run_id = %run_id,
            step = %step,
            violations = ?violations,
            "agent output does not match the output schema; accepted"
        ),
        WorkflowEvent::StepCompleted {
            run_id,
            step,
            duration_ms,
            fallback,
        } => tracing::info!(
            run_id = %run_id,
            step = %step,
            duration_ms,
            fallback,
            "step completed"
        ),
        WorkflowEvent::StepFailed {
            run_id,
            step,
            kind,
            error,
        } => tracing::error!(
            run_id = %run_id,
            step = %step,
            kind = %kind,
            error = %error,
            "step failed"
        ),
        WorkflowEvent::CheckpointWritten {
            run_id,
            step,
            sequence,
        } => tracing::debug!(run_id = %run_id, step = %step, sequence, "checkpoint written"),
        WorkflowEvent::RunCompleted {
            run_id,
            workflow,
            duration_ms,
            steps_completed,
        } => tracing::info!(
            run_id = %run_id,
            workflow = %workflow,
            duration_ms,
            steps_completed,
            "workflow run completed"
        ),
        WorkflowEvent::RunFailed {
            run_id,
            workflow,
            step,
            kind,
        } => tracing::error!(
            run_id = %run_id,
            workflow = %workflow,
            step = %step,
            kind = %kind,
            "workflow run failed"
        ),
        WorkflowEvent::RunCancelled { run_id, workflow } => {
            tracing::warn!(run_id = %run_id, workflow = %workflow, "workflow run cancelled")
        }
    }
}
