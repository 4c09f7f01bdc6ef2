use crate::contrastive_loss::ContrastiveLoss;
use crate::data_loader::MeshTextDataLoader;
use crate::grad_cache::{naive_step, GradCache, StepOutput};
use crate::model_traits::ContrastiveEncoderT;

use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub struct TrainConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// meshes per optimization step
    pub batch_size: usize,
    /// descriptions sampled (with replacement) per mesh
    pub descs_per_mesh: usize,
    pub num_epochs: usize,
    pub seed: u64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-6,
            weight_decay: 0.2,
            batch_size: 100,
            descs_per_mesh: 5,
            num_epochs: 32,
            seed: 42,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    fn adamw_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

/// Per-step history of a training run
#[derive(Clone, Debug, Default)]
pub struct TrainTrace {
    pub loss: Vec<f32>,
    pub mesh_to_text_accuracy: Vec<f32>,
    pub text_to_mesh_accuracy: Vec<f32>,
}

impl TrainTrace {
    fn push(&mut self, step: &StepOutput) {
        self.loss.push(step.loss);
        self.mesh_to_text_accuracy.push(step.mesh_to_text_accuracy);
        self.text_to_mesh_accuracy.push(step.text_to_mesh_accuracy);
    }

    pub fn num_steps(&self) -> usize {
        self.loss.len()
    }
}

pub struct ContrastiveTrainer<'a, MeshEnc, TextEnc>
where
    MeshEnc: ContrastiveEncoderT + Sync,
    TextEnc: ContrastiveEncoderT + Sync,
{
    pub mesh_encoder: &'a MeshEnc,
    pub text_encoder: &'a TextEnc,
    pub criterion: &'a ContrastiveLoss,
    pub variable_map: &'a VarMap,
}

impl<'a, MeshEnc, TextEnc> ContrastiveTrainer<'a, MeshEnc, TextEnc>
where
    MeshEnc: ContrastiveEncoderT + Sync,
    TextEnc: ContrastiveEncoderT + Sync,
{
    /// * `mesh_encoder`, `text_encoder`, `criterion` - modules whose
    ///   variables all live in `variable_map`
    pub fn build(
        mesh_encoder: &'a MeshEnc,
        text_encoder: &'a TextEnc,
        criterion: &'a ContrastiveLoss,
        variable_map: &'a VarMap,
    ) -> Self {
        Self {
            mesh_encoder,
            text_encoder,
            criterion,
            variable_map,
        }
    }

    /// Train both encoders and the temperature
    /// * `data` - data loader of annotated meshes
    /// * `grad_cache` - gradient cache; `None` back-propagates each full batch at once
    /// * `train_config` - training configuration
    pub fn train<DataL>(
        &mut self,
        data: &mut DataL,
        grad_cache: Option<&GradCache>,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainTrace>
    where
        DataL: MeshTextDataLoader,
    {
        let device = &train_config.device;
        let mut adam = AdamW::new(self.variable_map.all_vars(), train_config.adamw_params())?;
        let mut rng = StdRng::seed_from_u64(train_config.seed);

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = TrainTrace::default();

        for epoch in 0..train_config.num_epochs {
            data.shuffle_minibatch(train_config.batch_size, &mut rng)?;

            let mut loss_tot = 0_f32;

            for b in 0..data.num_minibatch() {
                let batch = data.minibatch(b, train_config.descs_per_mesh, device, &mut rng)?;

                let step = match grad_cache {
                    Some(gc) => gc.step(
                        self.mesh_encoder,
                        self.text_encoder,
                        self.criterion,
                        &batch.meshes,
                        &batch.descriptions,
                        &batch.association,
                    )?,
                    None => naive_step(
                        self.mesh_encoder,
                        self.text_encoder,
                        self.criterion,
                        &batch.meshes,
                        &batch.descriptions,
                        &batch.association,
                    )?,
                };

                adam.step(&step.grads)?;
                loss_tot += step.loss;
                trace.push(&step);
            }

            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] contrastive loss: {}, accuracy (mesh->text): {}",
                    epoch + 1,
                    loss_tot / data.num_minibatch().max(1) as f32,
                    trace
                        .mesh_to_text_accuracy
                        .last()
                        .ok_or(anyhow::anyhow!("accuracy"))?
                );
            }
        } // each epoch

        pb.finish_and_clear();
        Ok(trace)
    }
}
