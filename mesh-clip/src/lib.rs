pub mod association;
pub mod batch_split;
pub mod cli;
pub mod contrastive_loss;
pub mod data_loader;
pub mod error;
pub mod grad_cache;
pub mod layers;
pub mod loss_functions;
pub mod mesh_encoder;
pub mod mesh_graph;
pub mod model_traits;
pub mod text_encoder;
pub mod trainer;

pub use candle_core;
pub use candle_nn;
