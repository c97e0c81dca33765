use anyhow::Result;
use clap::Parser;
use pacer::cli::{self, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.verbose);
    cli::run(cli)
}
