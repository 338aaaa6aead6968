//! `specgen`: compile container creation requests into OCI runtime configs.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Compile(args) => commands::compile::execute(args, &cli.global),
        Commands::ParseNamespace(args) => commands::parse_namespace::execute(args, &cli.global),
        Commands::ParsePort(args) => commands::parse_port::execute(args),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.debug);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
