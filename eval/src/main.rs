mod cli;
mod judge;
mod report;
mod task_dirs;
mod verify;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "envforge-eval",
    version,
    about = "Re-verify and summarize generated environments"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild each task directory's image and rerun the F2P protocol.
    Verify {
        root: PathBuf,
        #[arg(long, default_value = "envforge.toml")]
        config: PathBuf,
    },
    /// Classify saved test logs without Docker.
    Judge {
        root: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Aggregate status.json outcomes.
    Report { root: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    envforge::logging::init(false);
    match cli.command {
        Command::Verify { root, config } => cli::verify(&root, &config),
        Command::Judge { root, output } => cli::judge(&root, &output),
        Command::Report { root } => cli::report(&root),
    }
}
