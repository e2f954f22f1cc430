//! Bounded fan-out for `parallel` steps.
//!
//! Children run as `JoinSet` tasks, each holding a semaphore permit, on a
//! forked copy of the execution context. Results are merged back in
//! declaration order regardless of completion order. A failing child does
//! not stop its siblings; the step fails once every launched child has
//! finished, with the per-child aggregate attached as partial output.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use stepwise_types::error::{ErrorKind, FailureReport};
use stepwise_types::workflow::StepDefinition;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::checkpoint::CheckpointStore;
use super::context::ExecutionContext;
use super::dispatcher::{Disposition, Dispatcher, Frame, Halt, Produced, RunState, failure};
use super::expression::SlotValue;

type ChildResult = Result<(Disposition, ExecutionContext), Halt>;

impl Dispatcher {
    pub(crate) async fn run_parallel<S: CheckpointStore + 'static>(
        &self,
        step: &StepDefinition,
        children: &[StepDefinition],
        max_concurrent: Option<usize>,
        ctx: &mut ExecutionContext,
        state: &Arc<RunState<S>>,
        frame: Frame,
    ) -> Result<Produced, Halt> {
        let limit = max_concurrent
            .unwrap_or(self.config().default_max_concurrent)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<ChildResult> = JoinSet::new();
        let mut task_index = HashMap::with_capacity(children.len());
        let mut results: Vec<Option<ChildResult>> = children.iter().map(|_| None).collect();

        tracing::debug!(
            step = %step.name,
            children = children.len(),
            max_concurrent = limit,
            "fanning out parallel step"
        );

        for (index, child) in children.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dispatcher = self.clone();
            let child = child.clone();
            let state = Arc::clone(state);
            let mut child_ctx = ctx.fork();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let disposition = dispatcher
                    .execute_step(&child, &mut child_ctx, &state, frame)
                    .await?;
                Ok::<_, Halt>((disposition, child_ctx))
            });
            task_index.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    if let Some(&index) = task_index.get(&id) {
                        results[index] = Some(result);
                    }
                }
                Err(e) => {
                    if let Some(&index) = task_index.get(&e.id()) {
                        let child = &children[index];
                        results[index] = Some(Err(failure(
                            child,
                            ErrorKind::HandlerFailure,
                            format!("step task aborted: {e}"),
                        )
                        .into()));
                    }
                }
            }
        }

        // Merge in declaration order.
        let mut aggregate = Vec::with_capacity(children.len());
        let mut first_failure: Option<Box<FailureReport>> = None;
        let mut failed = 0usize;
        let mut interrupted = false;

        for (child, result) in children.iter().zip(results) {
            let entry = match result {
                Some(Ok((disposition, child_ctx))) => {
                    ctx.absorb(child_ctx)
                        .map_err(|e| failure(step, ErrorKind::StepDispatchError, e.to_string()))?;
                    match disposition {
                        Disposition::Skipped => json!({ "name": child.name, "status": "skipped" }),
                        Disposition::Completed | Disposition::Restored => json!({
                            "name": child.name,
                            "status": "completed",
                            "output": slot_value(ctx, &child.name),
                        }),
                    }
                }
                Some(Err(Halt::Failed(report))) => {
                    failed += 1;
                    let entry = json!({
                        "name": child.name,
                        "status": "failed",
                        "error": report.message,
                    });
                    if first_failure.is_none() {
                        first_failure = Some(report);
                    }
                    entry
                }
                Some(Err(Halt::Cancelled)) | None => {
                    interrupted = true;
                    json!({ "name": child.name, "status": "not_started" })
                }
            };
            aggregate.push(entry);
        }
        let aggregate = Value::Array(aggregate);

        if let Some(report) = first_failure {
            let mut report = *report;
            report.message = format!(
                "{} (parallel step '{}': {failed} of {} children failed)",
                report.message,
                step.name,
                children.len()
            );
            report.partial_output = Some(aggregate);
            return Err(Halt::Failed(Box::new(report)));
        }
        if interrupted {
            return Err(Halt::Cancelled);
        }
        Ok(Produced::value(aggregate))
    }
}

/// A child's slot as it appears in the aggregate.
fn slot_value(ctx: &ExecutionContext, name: &str) -> Value {
    match ctx.slot(name) {
        Some(SlotValue::Ready(value)) => value.as_ref().clone(),
        Some(SlotValue::Planned) => Value::String(format!("<steps.{name}.output>")),
        None => Value::Null,
    }
}
