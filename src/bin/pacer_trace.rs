use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use pacer::trace::{self, TraceConfig, TraceController};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pacer-trace", version, about = "Start and stop the harness trace session", long_about = None)]
struct TraceCli {
    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: TraceCommand,
}

#[derive(Subcommand, Debug)]
enum TraceCommand {
    /// Start the kernel + user trace session.
    Start(StartArgs),
    /// Stop the session if one is running.
    Stop(StopArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Location of the tracing tool binary.
    #[arg(long, short = 'x')]
    tool: Option<PathBuf>,

    /// Kernel provider to enable (repeatable).
    #[arg(long = "provider", short = 'r', value_name = "PROVIDER")]
    providers: Vec<String>,

    /// User-mode provider to enable (repeatable).
    #[arg(long = "user-provider", value_name = "PROVIDER")]
    user_providers: Vec<String>,

    /// Stack-walk option to collect (repeatable).
    #[arg(long = "stackwalk", short = 's', value_name = "OPTION")]
    stackwalk: Vec<String>,

    /// Base name of the trace output files.
    #[arg(long, short = 'e', value_name = "NAME")]
    output: Option<String>,

    /// Option file whose values fill flags not given on the command line.
    #[arg(long = "config-file", short = 'c', value_name = "FILE")]
    config_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StopArgs {
    /// Location of the tracing tool binary.
    #[arg(long, short = 'x')]
    tool: PathBuf,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "pacer=debug" } else { "pacer=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let args = TraceCli::parse();
    init_tracing(args.verbose);

    match args.command {
        TraceCommand::Start(start) => {
            let mut config = TraceConfig {
                tool_path: start.tool,
                kernel_providers: start.providers,
                user_providers: start.user_providers,
                stackwalk: start.stackwalk,
                output_name: start.output,
            };
            if let Some(path) = &start.config_file {
                config.merge_from_file(path)?;
            }
            let mut controller = TraceController::new();
            controller.start(&config)?;
            info!(session = trace::SESSION_NAME, "trace session running");
            Ok(())
        }
        TraceCommand::Stop(stop) => {
            trace::stop_session(&stop.tool, trace::SESSION_NAME)?;
            info!(session = trace::SESSION_NAME, "trace session stopped");
            Ok(())
        }
    }
}
