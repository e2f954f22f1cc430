//! CLI command definitions and dispatch for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing. Every command takes the
//! workflow document path as its first argument.

pub mod builtin;
pub mod checkpoint;
pub mod render;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Run declarative workflows with resumable checkpoints.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to `stepwise.toml` (defaults to ./stepwise.toml, then the
    /// platform config directory).
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow document.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Dry run: resolve expressions and show dispatch decisions without
    /// running any handler or agent.
    Plan {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Workflow input as KEY=VALUE (VALUE is parsed as JSON when possible).
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },

    /// Run a workflow, resuming from its checkpoint when one exists.
    Run(RunArgs),

    /// Resume an interrupted run. Fails if there is no checkpoint.
    Resume(ResumeArgs),

    /// Inspect or remove checkpoint files.
    Checkpoint {
        #[command(subcommand)]
        action: checkpoint::CheckpointCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the workflow YAML file.
    pub file: PathBuf,

    /// Workflow input as KEY=VALUE (VALUE is parsed as JSON when possible).
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Checkpoint file (defaults to <checkpoint_dir>/<workflow>.checkpoint.json).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Ignore an existing checkpoint and start over.
    #[arg(long)]
    pub fresh: bool,

    /// Resolve and trace decisions without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResumeArgs {
    /// Path to the workflow YAML file.
    pub file: PathBuf,

    /// Workflow input as KEY=VALUE (VALUE is parsed as JSON when possible).
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Checkpoint file (defaults to <checkpoint_dir>/<workflow>.checkpoint.json).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
}

impl From<ResumeArgs> for RunArgs {
    fn from(args: ResumeArgs) -> Self {
        Self {
            file: args.file,
            inputs: args.inputs,
            checkpoint: args.checkpoint,
            fresh: false,
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_repeated_inputs() {
        let cli = Cli::try_parse_from([
            "stepwise", "run", "flow.yaml", "-i", "tag=v1", "--input", "count=3", "--fresh",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.inputs, vec!["tag=v1", "count=3"]);
                assert!(args.fresh);
                assert!(!args.dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["stepwise", "validate", "flow.yaml", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
    }
}
