//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, sets up tracing, loads `stepwise.toml` and
//! dispatches to the command handlers.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use stepwise_infra::config::{load_engine_config, resolve_config_path};
use stepwise_types::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,stepwise_core=debug,stepwise_infra=debug",
        _ => "trace",
    };
    if let Err(e) = stepwise_observe::tracing_setup::init_tracing(filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    // Shell completions don't need configuration
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let config = match resolve_config_path(cli.config.as_deref()) {
        Some(path) => load_engine_config(&path).await,
        None => EngineConfig::default(),
    };

    let result = match cli.command {
        Commands::Validate { file } => cli::validate::validate(&file, cli.json).await,
        Commands::Plan { file, inputs } => cli::run::plan(&file, &inputs, &config, cli.json).await,
        Commands::Run(args) => cli::run::run(args, &config, cli.json, false).await,
        Commands::Resume(args) => cli::run::run(args.into(), &config, cli.json, true).await,
        Commands::Checkpoint { action } => {
            cli::checkpoint::handle_checkpoint_command(action, &config, cli.json).await
        }
        Commands::Completions { .. } => Ok(()),
    };

    stepwise_observe::tracing_setup::shutdown_tracing();
    result
}
