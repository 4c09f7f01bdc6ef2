pub mod synthetic;
pub mod train;

use clap::{Parser, Subcommand};

pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "mesh-clip")]
#[command(about = "Contrastive mesh/description training with gradient caching")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train on a synthetic corpus of annotated meshes
    Train(TrainArgs),
}
