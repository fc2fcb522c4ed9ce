//! CLI entry point: parse arguments, initialise logging, route to the
//! command implementations.

use clap::Parser;

use quench::cli::{execute, init_tracing, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = execute(cli.command).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
