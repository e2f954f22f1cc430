//! `checkpoint` subcommands: inspect and remove checkpoint files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepwise_core::workflow::checkpoint::CheckpointStore;
use stepwise_core::workflow::definition::load_workflow_file;
use stepwise_infra::checkpoint::{FileCheckpointStore, checkpoint_path_for};
use stepwise_types::checkpoint::CheckpointRecord;
use stepwise_types::config::EngineConfig;

use super::render::compact;

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// Show the entries of a checkpoint.
    Show {
        /// Checkpoint file, or a workflow YAML file whose default checkpoint
        /// should be shown.
        path: PathBuf,
    },

    /// Delete the checkpoint of a workflow so the next run starts fresh.
    #[command(alias = "rm")]
    Clear {
        /// Checkpoint file, or a workflow YAML file.
        path: PathBuf,
    },
}

pub async fn handle_checkpoint_command(
    cmd: CheckpointCommand,
    config: &EngineConfig,
    json: bool,
) -> Result<()> {
    match cmd {
        CheckpointCommand::Show { path } => show(&resolve_store(&path, config)?, json).await,
        CheckpointCommand::Clear { path } => clear(&resolve_store(&path, config)?, json).await,
    }
}

/// Workflow documents map to their default checkpoint location; anything
/// else is taken as the checkpoint file itself.
fn resolve_store(path: &Path, config: &EngineConfig) -> Result<FileCheckpointStore> {
    let is_workflow = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml");
    if !is_workflow {
        return Ok(FileCheckpointStore::new(path));
    }
    let def = load_workflow_file(path)
        .with_context(|| format!("Failed to load workflow {}", path.display()))?;
    Ok(FileCheckpointStore::new(checkpoint_path_for(
        &config.checkpoint_dir,
        &def.name,
    )))
}

async fn show(store: &FileCheckpointStore, json: bool) -> Result<()> {
    let Some(record) = store
        .load()
        .await
        .with_context(|| format!("Failed to read checkpoint {}", store.path().display()))?
    else {
        bail!("No checkpoint at {}", store.path().display());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Checkpoint for '{}'",
        style("*").green().bold(),
        style(&record.workflow).cyan()
    );
    println!("  File: {}", style(store.path().display()).dim());
    if let Some(run_id) = record.run_id {
        println!("  Run ID: {run_id}");
    }
    if let Some(created_at) = record.created_at {
        println!("  Created: {}", created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    println!("{}", entries_table(&record));
    println!();
    println!(
        "  {} completed step{}",
        style(record.entries.len()).bold(),
        if record.entries.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

fn entries_table(record: &CheckpointRecord) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Completed").fg(Color::White),
        Cell::new("Fallback").fg(Color::White),
        Cell::new("Output").fg(Color::White),
    ]);

    for (name, entry) in record.in_completion_order() {
        let fallback = if entry.fallback {
            Cell::new("yes").fg(Color::Yellow)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(entry.sequence),
            Cell::new(name).fg(Color::Cyan),
            Cell::new(entry.completed_at.format("%H:%M:%S").to_string()).fg(Color::DarkGrey),
            fallback,
            Cell::new(compact(&entry.output)),
        ]);
    }
    table
}

async fn clear(store: &FileCheckpointStore, json: bool) -> Result<()> {
    let existed = store.exists().await;
    store
        .remove()
        .await
        .with_context(|| format!("Failed to remove {}", store.path().display()))?;

    if json {
        let out = serde_json::json!({
            "path": store.path().display().to_string(),
            "removed": existed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if existed {
        println!(
            "  {} Removed {}",
            style("✓").green().bold(),
            store.path().display()
        );
    } else {
        println!("  No checkpoint at {}", store.path().display());
    }
    Ok(())
}
