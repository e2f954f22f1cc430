//! `validate` command.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use stepwise_core::workflow::definition::load_workflow_file;
use stepwise_types::workflow::WorkflowDefinition;

pub async fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Workflow {} is invalid", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary(&def))?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' v{} is valid",
        style("✓").green().bold(),
        style(&def.name).cyan(),
        def.version
    );
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }
    println!(
        "  Steps: {} ({} top-level)",
        def.all_steps().len(),
        def.steps.len()
    );

    if !def.inputs.is_empty() {
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Input").fg(Color::White),
            Cell::new("Type").fg(Color::White),
            Cell::new("Required").fg(Color::White),
            Cell::new("Default").fg(Color::White),
        ]);
        for (name, decl) in &def.inputs {
            let required = decl.is_required();
            table.add_row(vec![
                Cell::new(name).fg(Color::Cyan),
                Cell::new(decl.kind.to_string()),
                Cell::new(if required { "yes" } else { "no" }),
                Cell::new(
                    decl.default
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                )
                .fg(Color::DarkGrey),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

fn summary(def: &WorkflowDefinition) -> serde_json::Value {
    json!({
        "valid": true,
        "name": def.name,
        "version": def.version,
        "steps": def.all_steps().len(),
        "top_level_steps": def.steps.len(),
        "inputs": def.inputs.keys().collect::<Vec<_>>(),
        "outputs": def.outputs.keys().collect::<Vec<_>>(),
    })
}
