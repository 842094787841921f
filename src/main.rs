//! Flotilla CLI: resolve layered unit configs and run operations on them.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "flotilla",
    version,
    about = "Layered, templated chart deployments for groups of units"
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: flotilla::cli::Commands,
}

fn main() {
    let cli = Cli::parse();

    let default = if cli.verbose { "flotilla=debug" } else { "flotilla=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = flotilla::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
