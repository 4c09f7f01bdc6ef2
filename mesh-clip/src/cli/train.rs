use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::contrastive_loss::ContrastiveLoss;
use crate::data_loader::InMemoryMeshTextData;
use crate::grad_cache::{GradCache, GradCacheConfig};
use crate::mesh_encoder::{MeshEncoderConfig, MeshGraphEncoder};
use crate::text_encoder::{DescriptionEncoder, DescriptionEncoderConfig};
use crate::trainer::{ContrastiveTrainer, TrainConfig};

use super::synthetic::{generate_corpus, SyntheticCorpusArgs};

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(short, long, default_value = "32")]
    pub epochs: usize,

    #[arg(short, long, default_value = "100", help = "Meshes per optimization step")]
    pub batch_size: usize,

    #[arg(long, default_value = "2", help = "Meshes encoded at once in the cached passes")]
    pub sub_batch_size: usize,

    #[arg(long, default_value = "5", help = "Descriptions sampled per mesh in each batch")]
    pub descs_per_mesh: usize,

    #[arg(long, default_value = "64", help = "Dimension of the joint embedding space")]
    pub embed_dim: usize,

    #[arg(long, default_value = "400", help = "Synthetic meshes to generate")]
    pub num_meshes: usize,

    #[arg(long, default_value = "8", help = "Shape families in the synthetic corpus")]
    pub num_classes: usize,

    #[arg(long, default_value = "256")]
    pub vocab_size: usize,

    #[arg(long, default_value = "16", help = "Tokens per padded description")]
    pub context_length: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, default_value = "5e-5")]
    pub learning_rate: f64,

    #[arg(long, default_value = "0.2")]
    pub weight_decay: f64,

    #[arg(long, help = "Back-propagate each full batch at once instead of caching")]
    pub no_cache: bool,

    #[arg(long, help = "Encode meshes and descriptions concurrently in the cached pass")]
    pub parallel: bool,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: &TrainArgs) -> Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        { Device::new_metal(0).unwrap_or(Device::Cpu) }
        #[cfg(target_os = "linux")]
        { Device::new_cuda(0).unwrap_or(Device::Cpu) }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        { Device::Cpu }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    let mut rng = StdRng::seed_from_u64(args.seed);

    let corpus = generate_corpus(
        &SyntheticCorpusArgs {
            num_meshes: args.num_meshes,
            num_classes: args.num_classes,
            vocab_size: args.vocab_size,
            descs_per_mesh: args.descs_per_mesh,
            desc_length: args.context_length,
            noise: 0.05,
        },
        &mut rng,
    )?;
    info!("Generated {} annotated meshes", corpus.len());

    let mut data = InMemoryMeshTextData::new(corpus, args.context_length)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let mesh_encoder =
        MeshGraphEncoder::new(MeshEncoderConfig::with_embed_dim(args.embed_dim), vb.pp("mesh"))?;

    let text_encoder = DescriptionEncoder::new(
        DescriptionEncoderConfig {
            vocab_size: args.vocab_size,
            token_dim: args.embed_dim,
            layers: vec![args.embed_dim, args.embed_dim],
            embed_dim: args.embed_dim,
        },
        vb.pp("text"),
    )?;

    let criterion = ContrastiveLoss::new(vb.pp("loss"))?;

    info!(
        "{} variables, {} parameters",
        varmap.all_vars().len(),
        varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>()
    );

    let grad_cache = if args.no_cache {
        info!("Gradient caching disabled");
        None
    } else {
        let config = GradCacheConfig {
            mesh_chunk_size: args.sub_batch_size,
            text_chunk_size: args.sub_batch_size * args.descs_per_mesh,
            parallel_cache_pass: args.parallel,
            ..Default::default()
        };
        info!(
            "Gradient cache: {} meshes / {} descriptions per sub-batch",
            config.mesh_chunk_size, config.text_chunk_size
        );
        Some(GradCache::new(config)?)
    };

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        batch_size: args.batch_size,
        descs_per_mesh: args.descs_per_mesh,
        num_epochs: args.epochs,
        seed: args.seed,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
        ..Default::default()
    };

    let mut trainer =
        ContrastiveTrainer::build(&mesh_encoder, &text_encoder, &criterion, &varmap);
    let trace = trainer.train(&mut data, grad_cache.as_ref(), &train_config)?;

    if let (Some(first), Some(last)) = (trace.loss.first(), trace.loss.last()) {
        info!(
            "Trained {} steps: loss {:.4} -> {:.4}",
            trace.num_steps(),
            first,
            last
        );
    }

    let temperature = 1. / criterion.logit_scale().exp()?.to_scalar::<f32>()?;
    info!("Learned temperature: {:.4}", temperature);

    Ok(())
}
