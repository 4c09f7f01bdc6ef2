use anyhow::Result;
use clap::Parser;
use mesh_clip::cli::{train, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run(args)?;
        }
    }

    Ok(())
}
