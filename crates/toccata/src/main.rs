use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;
mod config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => args.run(),
        Command::Calibrate(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "toccata", about = "Motion-core tooling for Toccata")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a job file through the planner in simulation mode and report the
    /// print time.
    Simulate(cli::simulate::SimulateArgs),
    /// Run a delta auto-calibration from a file of probed points.
    Calibrate(cli::calibrate::CalibrateArgs),
}
