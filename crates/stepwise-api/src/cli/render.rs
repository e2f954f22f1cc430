//! Styled terminal output for run outcomes, failure reports and decision
//! traces.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use stepwise_core::workflow::{EngineError, RunOutcome, RunStatus};
use stepwise_types::error::FailureReport;
use stepwise_types::event::{GateDecision, SkipReason, WorkflowEvent};

/// Longest value rendered inline in a table cell.
const MAX_CELL: usize = 60;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

pub fn print_outcome(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let headline = match outcome.status {
        RunStatus::Completed => format!(
            "{} Workflow '{}' completed in {}ms",
            style("✓").green().bold(),
            style(&outcome.workflow).cyan(),
            outcome.duration_ms
        ),
        RunStatus::Planned => format!(
            "{} Plan for workflow '{}'",
            style("i").blue().bold(),
            style(&outcome.workflow).cyan()
        ),
        RunStatus::Cancelled => format!(
            "{} Workflow '{}' cancelled",
            style("!").yellow().bold(),
            style(&outcome.workflow).cyan()
        ),
    };

    println!();
    println!("  {headline}");
    println!("  Run ID: {}", style(outcome.run_id).dim());
    if !outcome.restored_steps.is_empty() {
        println!(
            "  Restored from checkpoint: {}",
            outcome.restored_steps.join(", ")
        );
    }
    println!();
    println!("{}", trace_table(&outcome.trace));

    if !outcome.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        for (name, value) in &outcome.outputs {
            println!("  {} {}", style(format!("{name}:")).bold(), compact(value));
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

pub fn print_failure(err: &EngineError, json: bool) -> anyhow::Result<()> {
    if json {
        let body = match err.report() {
            Some(report) => serde_json::json!({
                "status": "failed",
                "report": report,
                "trace": err.trace(),
            }),
            None => serde_json::json!({
                "status": "failed",
                "kind": err.kind(),
                "message": err.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!();
    match err.report() {
        Some(report) => {
            if !err.trace().is_empty() {
                println!("{}", trace_table(err.trace()));
                println!();
            }
            for line in failure_lines(report) {
                println!("  {line}");
            }
        }
        None => {
            println!(
                "  {} {} {}",
                style("✗").red().bold(),
                style(err.kind()).red(),
                err
            );
        }
    }
    println!();
    Ok(())
}

/// Report fields as display lines, most important first.
pub fn failure_lines(report: &FailureReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{} Step '{}' failed ({})",
        style("✗").red().bold(),
        style(&report.step).cyan(),
        style(report.kind).red()
    )];
    if let Some(step_type) = report.step_type {
        lines.push(format!("Type: {step_type}"));
    }
    lines.push(format!("Error: {}", report.message));
    if let Some(fallback) = report.fallback {
        let result = match (fallback.attempted, fallback.succeeded) {
            (false, _) => "not attempted",
            (true, true) => "attempted, succeeded",
            (true, false) => "attempted, failed",
        };
        lines.push(format!("Fallback: {result}"));
    }
    if let Some(partial) = &report.partial_output {
        lines.push(format!("Partial output: {}", compact(partial)));
    }
    lines
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// Decision trace as a table: event, step, detail.
pub fn trace_table(events: &[WorkflowEvent]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Event").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Detail").fg(Color::White),
    ]);

    for event in events {
        let color = match event {
            WorkflowEvent::StepFailed { .. } | WorkflowEvent::RunFailed { .. } => Color::Red,
            WorkflowEvent::FallbackOccurred { .. } | WorkflowEvent::SchemaMismatch { .. } => {
                Color::Yellow
            }
            WorkflowEvent::StepCompleted { .. } | WorkflowEvent::RunCompleted { .. } => {
                Color::Green
            }
            WorkflowEvent::StepSkipped { .. } | WorkflowEvent::CheckpointWritten { .. } => {
                Color::DarkGrey
            }
            _ => Color::Cyan,
        };
        table.add_row(vec![
            Cell::new(event.label()).fg(color),
            Cell::new(event.step().unwrap_or("")),
            Cell::new(describe_event(event)),
        ]);
    }
    table
}

/// One-line description of what an event says.
pub fn describe_event(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::RunStarted { workflow, dry_run, .. } => {
            if *dry_run {
                format!("planning {workflow}")
            } else {
                format!("running {workflow}")
            }
        }
        WorkflowEvent::RunResumed { restored_steps, .. } => {
            format!("{restored_steps} step(s) restored from checkpoint")
        }
        WorkflowEvent::StepStarted { step_type, .. } => step_type.to_string(),
        WorkflowEvent::StepSkipped { reason, .. } => match reason {
            SkipReason::Guard => "guard was false".to_string(),
            SkipReason::Checkpointed => "already checkpointed".to_string(),
        },
        WorkflowEvent::ModeSelected {
            requested,
            selected,
            forced,
            ..
        } => match forced {
            Some(why) => format!("{selected} (requested {requested}, {why})"),
            None => selected.to_string(),
        },
        WorkflowEvent::AutonomyDecision {
            autonomy, decision, ..
        } => {
            let decision = match decision {
                GateDecision::Refused => "agent mode refused",
                GateDecision::Accepted => "agent result accepted",
                GateDecision::AcceptedWithWarning => "agent result accepted with warning",
                GateDecision::HandlerAuthoritative => "handler result used",
                GateDecision::Rejected => "agent result rejected",
            };
            format!("{autonomy}: {decision}")
        }
        WorkflowEvent::FallbackOccurred {
            reason, succeeded, ..
        } => format!(
            "{reason}, fallback {}",
            if *succeeded { "succeeded" } else { "failed" }
        ),
        WorkflowEvent::SchemaMismatch { violations, .. } => truncate(&violations.join("; ")),
        WorkflowEvent::StepCompleted {
            duration_ms,
            fallback,
            ..
        } => {
            if *fallback {
                format!("{duration_ms}ms via fallback")
            } else {
                format!("{duration_ms}ms")
            }
        }
        WorkflowEvent::StepFailed { kind, error, .. } => format!("{kind}: {}", truncate(error)),
        WorkflowEvent::CheckpointWritten { sequence, .. } => format!("entry #{sequence}"),
        WorkflowEvent::RunCompleted {
            duration_ms,
            steps_completed,
            ..
        } => format!("{steps_completed} step(s) in {duration_ms}ms"),
        WorkflowEvent::RunFailed { kind, .. } => kind.to_string(),
        WorkflowEvent::RunCancelled { .. } => "cancelled".to_string(),
    }
}

/// JSON value on one line, shortened for display.
pub fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => truncate(s),
        other => truncate(&other.to_string()),
    }
}

pub fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_CELL {
        let cut: String = text.chars().take(MAX_CELL - 3).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::error::{ErrorKind, FallbackReason};
    use stepwise_types::workflow::{AutonomyLevel, ExecutionMode};
    use uuid::Uuid;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn truncate_shortens_long_text() {
        let long = "x".repeat(100);
        let out = truncate(&long);
        assert_eq!(out.chars().count(), MAX_CELL);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn compact_renders_strings_without_quotes() {
        assert_eq!(compact(&json!("feat-x")), "feat-x");
        assert_eq!(compact(&json!({ "a": 1 })), r#"{"a":1}"#);
    }

    #[test]
    fn describe_fallback_includes_reason() {
        let event = WorkflowEvent::FallbackOccurred {
            run_id: Uuid::nil(),
            step: "create_branch".to_string(),
            reason: FallbackReason::CollaboratorValidationUsedHandler,
            succeeded: true,
        };
        assert_eq!(
            describe_event(&event),
            "collaborator_validation_used_handler, fallback succeeded"
        );
    }

    #[test]
    fn describe_forced_mode_mentions_request() {
        let event = WorkflowEvent::ModeSelected {
            run_id: Uuid::nil(),
            step: "s".to_string(),
            requested: ExecutionMode::Agent,
            selected: ExecutionMode::Deterministic,
            forced: Some("operator autonomy".to_string()),
        };
        let text = describe_event(&event);
        assert!(text.contains("requested agent"));
        assert!(text.contains("operator autonomy"));
    }

    #[test]
    fn describe_autonomy_decision() {
        let event = WorkflowEvent::AutonomyDecision {
            run_id: Uuid::nil(),
            step: "s".to_string(),
            autonomy: AutonomyLevel::Approver,
            decision: GateDecision::Rejected,
        };
        assert!(describe_event(&event).ends_with("agent result rejected"));
    }

    #[test]
    fn failure_lines_report_fallback_outcome() {
        let report = FailureReport::new("publish", None, ErrorKind::AgentExecutionError, "boom")
            .with_fallback(true, false);
        let lines = failure_lines(&report);
        assert!(lines[0].contains("publish"));
        assert!(lines.iter().any(|l| l == "Error: boom"));
        assert!(lines.iter().any(|l| l == "Fallback: attempted, failed"));
    }
}
