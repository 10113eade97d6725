use std::process::ExitCode;

use clap::Parser;
use gapless_cli::Cli;
use gapless_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    run_main(cli).await
}
