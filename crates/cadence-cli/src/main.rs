//! cadenced - launcher for the cadence audio server.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cadenced")]
#[command(author, version, about = "Cadence audio graph server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the server and run until interrupted
    Run(commands::run::RunArgs),

    /// List available drivers and internal client modules
    Drivers(commands::drivers::DriversArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Drivers(args) => commands::drivers::run(args),
    }
}
