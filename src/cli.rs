use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::Harness;
use crate::config::{HarnessSettings, default_config_path};

#[derive(Parser, Debug)]
#[command(name = "pacer", version, about = "Browser performance benchmark harness", long_about = None)]
pub struct Cli {
    /// Suite configuration file (TOML).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Harness root used for ${pacer} interpolation and as the content
    /// server docroot (defaults to the config file's directory).
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Tolerate missing browser metadata and serve content locally.
    #[arg(long, action = ArgAction::SetTrue)]
    pub develop: bool,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

/// Install the tracing subscriber for a harness binary.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "pacer=debug" } else { "pacer=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Load the suite, run it, and log per-test summaries.
pub fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    info!(path = %config_path.display(), "using suite config");

    let mut settings = HarnessSettings::load(&config_path)?;
    if cli.develop {
        settings.browser.develop = true;
    }

    let root = match cli.root {
        Some(root) => root,
        None => config_path
            .parent()
            .map(|parent| parent.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let mut harness = Harness::new(settings, root);
    let report = harness.run()?;

    info!(run = %report.run_id, tests = report.results.len(), "run complete");
    for result in &report.results {
        info!(test = %result.name, summary = ?result.summary, "test summary");
    }
    Ok(())
}
