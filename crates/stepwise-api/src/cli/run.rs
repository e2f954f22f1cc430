//! `plan`, `run` and `resume` commands.
//!
//! Wires the engine to the filesystem and subprocess adapters, shows a
//! spinner fed by the event bus while the run is in flight and cancels the
//! run at the next step boundary on Ctrl-C.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stepwise_core::event::EventBus;
use stepwise_core::workflow::definition::load_workflow_file;
use stepwise_core::workflow::{Dispatcher, DispatcherConfig, RunOptions, RunStatus};
use stepwise_infra::checkpoint::{FileCheckpointStore, checkpoint_path_for};
use stepwise_infra::workflow::{CommandStageRunner, CommandStepExecutor, FsWorkflowSource};
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::WorkflowDefinition;

use super::RunArgs;
use super::builtin::builtin_registry;
use super::render;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub async fn plan(
    file: &Path,
    raw_inputs: &[String],
    config: &EngineConfig,
    json: bool,
) -> Result<()> {
    let def = load_definition(file)?;
    let inputs = parse_inputs(raw_inputs)?;
    let dispatcher = build_dispatcher(config, file);

    match dispatcher.plan(&def, inputs).await {
        Ok(outcome) => render::print_outcome(&outcome, json),
        Err(err) => {
            render::print_failure(&err, json)?;
            bail!("planning workflow '{}' failed", def.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Run / resume
// ---------------------------------------------------------------------------

/// Run a workflow. With `require_checkpoint` the checkpoint file must
/// already exist (the `resume` command).
pub async fn run(
    args: RunArgs,
    config: &EngineConfig,
    json: bool,
    require_checkpoint: bool,
) -> Result<()> {
    let def = load_definition(&args.file)?;
    let inputs = parse_inputs(&args.inputs)?;
    let dispatcher = build_dispatcher(config, &args.file);

    let path = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| checkpoint_path_for(&config.checkpoint_dir, &def.name));
    let store = FileCheckpointStore::new(path);
    if require_checkpoint && !store.exists().await {
        bail!(
            "No checkpoint for workflow '{}' at {}",
            def.name,
            store.path().display()
        );
    }
    tracing::info!(
        workflow = %def.name,
        checkpoint = %store.path().display(),
        fresh = args.fresh,
        dry_run = args.dry_run,
        "starting run"
    );

    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_watcher(cancel.clone());

    let mut options = RunOptions::with_checkpoint(store.clone()).cancel_token(cancel);
    if args.fresh {
        options = options.fresh();
    }
    if args.dry_run {
        options = options.dry_run();
    }

    let progress = Progress::start(&dispatcher, json);
    let result = dispatcher.run(&def, inputs, options).await;
    progress.finish();
    interrupt.abort();

    match result {
        Ok(outcome) => {
            render::print_outcome(&outcome, json)?;
            if outcome.status == RunStatus::Cancelled {
                bail!(
                    "run cancelled; continue with `stepwise resume {}`",
                    args.file.display()
                );
            }
            Ok(())
        }
        Err(err) => {
            render::print_failure(&err, json)?;
            if !json && err.report().is_some() && store.exists().await {
                println!(
                    "  Completed steps are checkpointed in {}",
                    style(store.path().display()).dim()
                );
                println!(
                    "  Continue with: {}",
                    style(format!("stepwise resume {}", args.file.display())).yellow()
                );
                println!();
            }
            bail!("workflow '{}' failed", def.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).with_context(|| format!("Failed to load workflow {}", file.display()))
}

/// Dispatcher with built-in handlers and the configured agent, stages and a
/// subworkflow source rooted next to `file`.
pub fn build_dispatcher(config: &EngineConfig, file: &Path) -> Dispatcher {
    let base_dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut dispatcher_config = DispatcherConfig::from_engine_config(config);
    dispatcher_config.base_dir = base_dir.clone();

    let mut builder = Dispatcher::builder(builtin_registry())
        .config(dispatcher_config)
        .events(EventBus::new(config.event_capacity))
        .stage_runner(Arc::new(CommandStageRunner::new(config.stages.clone())))
        .workflow_source(Arc::new(FsWorkflowSource::new(base_dir)));

    match CommandStepExecutor::from_config(&config.agent) {
        Some(executor) => builder = builder.executor(Arc::new(executor)),
        None => tracing::debug!("no agent command configured, agent steps will use handlers"),
    }
    builder.build()
}

/// Parse `KEY=VALUE` pairs. Values that parse as JSON keep their type;
/// anything else is a string.
pub fn parse_inputs(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid input '{pair}': expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid input '{pair}': empty key");
        }
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

fn spawn_interrupt_watcher(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next step boundary");
            cancel.cancel();
        }
    })
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Spinner driven by engine events. Disabled for JSON output and when
/// stderr is not a terminal.
struct Progress {
    spinner: Option<ProgressBar>,
    task: Option<JoinHandle<()>>,
}

impl Progress {
    fn start(dispatcher: &Dispatcher, json: bool) -> Self {
        if json || !console::Term::stderr().is_term() {
            return Self {
                spinner: None,
                task: None,
            };
        }

        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message("Starting...");
        spinner.enable_steady_tick(Duration::from_millis(80));

        let mut events = dispatcher.subscribe();
        let bar = spinner.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(message) = progress_message(&event) {
                    bar.set_message(message);
                }
            }
        });

        Self {
            spinner: Some(spinner),
            task: Some(task),
        }
    }

    fn finish(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        if let Some(spinner) = self.spinner {
            spinner.finish_and_clear();
        }
    }
}

fn progress_message(event: &WorkflowEvent) -> Option<String> {
    match event {
        WorkflowEvent::StepStarted {
            step, step_type, ..
        } => Some(format!("Running {step} ({step_type})...")),
        WorkflowEvent::FallbackOccurred { step, reason, .. } => {
            Some(format!("{step}: falling back to handler ({reason})"))
        }
        WorkflowEvent::CheckpointWritten { step, .. } => Some(format!("Checkpointed {step}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::workflow::StepType;
    use uuid::Uuid;

    fn raw(pairs: &[&str]) -> Vec<String> {
        pairs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inputs_keep_json_types() {
        let inputs = parse_inputs(&raw(&["count=3", "flag=true", "tags=[\"a\",\"b\"]"])).unwrap();
        assert_eq!(inputs["count"], json!(3));
        assert_eq!(inputs["flag"], json!(true));
        assert_eq!(inputs["tags"], json!(["a", "b"]));
    }

    #[test]
    fn non_json_values_are_strings() {
        let inputs = parse_inputs(&raw(&["branch_name=feat-x", "expr=a=b"])).unwrap();
        assert_eq!(inputs["branch_name"], json!("feat-x"));
        assert_eq!(inputs["expr"], json!("a=b"));
    }

    #[test]
    fn later_inputs_override_earlier_ones() {
        let inputs = parse_inputs(&raw(&["tag=v1", "tag=v2"])).unwrap();
        assert_eq!(inputs["tag"], json!("v2"));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(parse_inputs(&raw(&["novalue"])).is_err());
        assert!(parse_inputs(&raw(&["=x"])).is_err());
    }

    #[test]
    fn dispatcher_is_rooted_next_to_the_document() {
        let dispatcher =
            build_dispatcher(&EngineConfig::default(), Path::new("flows/release.yaml"));
        assert_eq!(dispatcher.config().base_dir, PathBuf::from("flows"));
        assert!(dispatcher.registry().contains("shell"));

        let bare = build_dispatcher(&EngineConfig::default(), Path::new("release.yaml"));
        assert_eq!(bare.config().base_dir, PathBuf::from("."));
    }

    #[test]
    fn progress_messages_for_step_events() {
        let started = WorkflowEvent::StepStarted {
            run_id: Uuid::nil(),
            step: "build".to_string(),
            step_type: StepType::Python,
        };
        assert_eq!(progress_message(&started).unwrap(), "Running build (python)...");

        let cancelled = WorkflowEvent::RunCancelled {
            run_id: Uuid::nil(),
            workflow: "release".to_string(),
        };
        assert!(progress_message(&cancelled).is_none());
    }

    #[tokio::test]
    async fn run_executes_workflow_and_writes_checkpoint() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("hello.yaml");
        tokio::fs::write(
            &file,
            "name: hello\nversion: \"0.1.0\"\ninputs:\n  who:\n    type: string\nsteps:\n  - name: greet\n    type: python\n    action: echo\n    inputs:\n      text: \"hi {{ inputs.who }}\"\noutputs:\n  text: \"{{ steps.greet.output.text }}\"\n",
        )
        .await
        .unwrap();
        let config = EngineConfig {
            checkpoint_dir: tmp.path().join("checkpoints"),
            ..EngineConfig::default()
        };
        let args = RunArgs {
            file: file.clone(),
            inputs: raw(&["who=ada"]),
            checkpoint: None,
            fresh: false,
            dry_run: false,
        };

        run(args.clone(), &config, true, false).await.unwrap();
        let store = FileCheckpointStore::new(checkpoint_path_for(&config.checkpoint_dir, "hello"));
        assert!(store.exists().await);

        // The checkpoint now exists, so resume succeeds.
        run(args, &config, true, true).await.unwrap();
    }

    #[tokio::test]
    async fn resume_without_checkpoint_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("hello.yaml");
        tokio::fs::write(
            &file,
            "name: hello\nversion: \"0.1.0\"\nsteps:\n  - name: greet\n    type: python\n    action: echo\n",
        )
        .await
        .unwrap();
        let config = EngineConfig {
            checkpoint_dir: tmp.path().join("checkpoints"),
            ..EngineConfig::default()
        };
        let args = RunArgs {
            file,
            inputs: Vec::new(),
            checkpoint: None,
            fresh: false,
            dry_run: false,
        };

        let err = run(args, &config, true, true).await.unwrap_err();
        assert!(err.to_string().contains("No checkpoint"));
    }
}
