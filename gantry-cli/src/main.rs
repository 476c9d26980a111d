mod commands;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::plan::PlanArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// Run declarative job workflows locally
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow
    #[command(long_about = RUN_ABOUT)]
    Run(RunArgs),
    /// Check a workflow file without running it
    Validate(ValidateArgs),
    /// Show the instances a run would schedule, layer by layer
    Plan(PlanArgs),
}

const RUN_ABOUT: &str = "Run a workflow.

Concurrency groups are tracked by the engine of this process only: a run \
started by another `gantry run` never supersedes this one. Use --run-id to \
carry the id assigned by the event source into `run_id` and GANTRY_RUN_ID.";

/// Log level comes from `--verbose`, else `RUST_LOG`, else info.
/// Logs go to stderr so `run --json` keeps stdout clean.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("gantry=debug,workflow_engine=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gantry=info,workflow_engine=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!("gantry starting with args: {:?}", cli);

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args)?,
        Command::Plan(args) => commands::plan::execute(args)?,
    };

    Ok(ExitCode::from(code))
}
