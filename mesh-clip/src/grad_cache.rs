//! Gradient caching for contrastive training over large effective batches.
//!
//! One optimization step runs in four stages:
//!
//! 1. split each encoder's logical batch into sub-batches
//! 2. encode every sub-batch, detach the outputs and concatenate them
//!    into one leaf variable per encoder (no activations are kept)
//! 3. evaluate the contrastive loss on the leaves and back-propagate
//!    only as far as the leaves, giving one gradient row per example
//! 4. re-encode each sub-batch with tracking and back-propagate the
//!    surrogate `sum(z ⊙ dL/dz)` seeded with its rows of the cached
//!    gradient, adding the parameter gradients onto the step's store
//!
//! Peak activation memory is that of the largest sub-batch, while the
//! accumulated gradients equal those of one full-batch backward pass.

use crate::association::Association;
use crate::batch_split::{BatchInput, SubBatch};
use crate::contrastive_loss::{ContrastiveEvaluation, ContrastiveLoss};
use crate::error::GradCacheError;
use crate::model_traits::ContrastiveEncoderT;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use log::{debug, info};
use std::ops::Range;

#[derive(Clone, Debug)]
pub struct GradCacheConfig {
    /// graphs per mesh sub-batch
    pub mesh_chunk_size: usize,
    /// descriptions per text sub-batch
    pub text_chunk_size: usize,
    /// run the two representation passes with `rayon::join`
    pub parallel_cache_pass: bool,
    /// compare replayed representations against the cached ones
    pub verify_replay: bool,
    /// max abs difference tolerated by `verify_replay`
    pub replay_tolerance: f64,
}

impl Default for GradCacheConfig {
    fn default() -> Self {
        Self {
            mesh_chunk_size: 2,
            text_chunk_size: 10,
            parallel_cache_pass: false,
            verify_replay: true,
            replay_tolerance: 1e-4,
        }
    }
}

/// Representations of one logical batch, computed without keeping
/// the activation graph, plus what is needed to replay each sub-batch.
pub struct CachedRepresentation<'a> {
    leaf: Var,
    sub_batches: Vec<SubBatch<'a>>,
    spans: Vec<Range<usize>>,
}

impl CachedRepresentation<'_> {
    /// full representation (n x k), a fresh leaf of the graph
    pub fn representation(&self) -> &Tensor {
        self.leaf.as_tensor()
    }

    pub fn spans(&self) -> &[Range<usize>] {
        &self.spans
    }

    pub fn num_rows(&self) -> usize {
        self.spans.last().map(|r| r.end).unwrap_or(0)
    }
}

/// Encode each sub-batch in order and cache the concatenated,
/// detached output as a new variable
///
/// * `encoder` - encoder to run
/// * `sub_batches` - ordered sub-batches from `BatchInput::split`
pub fn cache_representations<'a, Enc>(
    encoder: &Enc,
    sub_batches: Vec<SubBatch<'a>>,
) -> anyhow::Result<CachedRepresentation<'a>>
where
    Enc: ContrastiveEncoderT + ?Sized,
{
    if sub_batches.is_empty() {
        return Err(GradCacheError::EmptyBatch.into());
    }

    let mut outputs = Vec::with_capacity(sub_batches.len());
    let mut spans = Vec::with_capacity(sub_batches.len());
    let mut lb = 0;

    for (i, sb) in sub_batches.iter().enumerate() {
        let z_nk = encoder.forward_sub_batch(sb)?;
        let nrows = sb.num_rows();

        if z_nk.dims() != [nrows, encoder.dim_embed()] {
            return Err(GradCacheError::shape_mismatch(format!(
                "sub-batch {} with {} rows was encoded as {:?}, expected [{}, {}]",
                i,
                nrows,
                z_nk.dims(),
                nrows,
                encoder.dim_embed()
            ))
            .into());
        }

        // drop the activation graph right here
        outputs.push(z_nk.detach());
        spans.push(lb..(lb + nrows));
        lb += nrows;

        debug!("cached sub-batch {} -> rows {:?}", i, spans[i]);
    }

    let z_nk = Tensor::cat(&outputs, 0)?;
    let leaf = Var::from_tensor(&z_nk)?;

    Ok(CachedRepresentation {
        leaf,
        sub_batches,
        spans,
    })
}

/// Parameter gradients of one optimization step.
///
/// Created from the loss gradients of the step and only ever added
/// onto afterwards; the driver starts each step with a new one, which
/// is the only way gradients are cleared.
pub struct GradientAccumulator {
    grads: GradStore,
}

impl GradientAccumulator {
    pub fn new(grads: GradStore) -> Self {
        Self { grads }
    }

    /// Add `grads[p]` onto the stored gradient of each `p` in `params`
    ///
    /// # Returns the number of parameters that received a gradient
    pub fn accumulate(&mut self, params: &[Tensor], grads: &GradStore) -> candle_core::Result<usize> {
        let mut nupdated = 0;
        for p in params {
            if let Some(g) = grads.get(p) {
                let sum = match self.grads.get(p) {
                    Some(prev) => prev.add(g)?,
                    None => g.clone(),
                };
                self.grads.insert(p, sum);
                nupdated += 1;
            }
        }
        Ok(nupdated)
    }

    pub fn get(&self, param: &Tensor) -> Option<&Tensor> {
        self.grads.get(param)
    }

    pub fn remove(&mut self, param: &Tensor) -> Option<Tensor> {
        self.grads.remove(param)
    }

    pub fn into_grad_store(self) -> GradStore {
        self.grads
    }
}

/// Re-encode every cached sub-batch with tracking and back-propagate
/// its rows of `grad_nk`, accumulating parameter gradients
///
/// * `encoder` - the same encoder that produced `cached`
/// * `cached` - consumed, so the same sub-batch sequence cannot be replayed twice
/// * `grad_nk` - dL/dz for every row of the cached representation
/// * `accumulator` - gradient store of the current step
/// * `config` - replay verification settings
pub fn replay_gradients<Enc>(
    encoder: &Enc,
    cached: CachedRepresentation<'_>,
    grad_nk: &Tensor,
    accumulator: &mut GradientAccumulator,
    config: &GradCacheConfig,
) -> anyhow::Result<()>
where
    Enc: ContrastiveEncoderT + ?Sized,
{
    let cached_nk = cached.representation();

    if grad_nk.dims() != cached_nk.dims() {
        return Err(GradCacheError::replay_mismatch(
            0,
            format!(
                "gradient {:?} does not match the cached representation {:?}",
                grad_nk.dims(),
                cached_nk.dims()
            ),
        )
        .into());
    }

    let params = encoder.parameters();

    for (i, (sb, span)) in cached.sub_batches.iter().zip(cached.spans.iter()).enumerate() {
        if sb.num_rows() != span.len() {
            return Err(GradCacheError::replay_mismatch(
                i,
                format!("{} rows vs. cached span {:?}", sb.num_rows(), span),
            )
            .into());
        }

        let z_nk = encoder.forward_sub_batch(sb)?;

        if z_nk.dims() != [span.len(), cached_nk.dims()[1]] {
            return Err(GradCacheError::replay_mismatch(
                i,
                format!("replayed {:?} vs. cached rows {:?}", z_nk.dims(), span),
            )
            .into());
        }

        if config.verify_replay {
            let gap = (z_nk.detach() - cached_nk.narrow(0, span.start, span.len())?)?
                .abs()?
                .max_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;

            if !(gap <= config.replay_tolerance) {
                return Err(GradCacheError::replay_mismatch(
                    i,
                    format!(
                        "replayed representation differs by {} (> {})",
                        gap, config.replay_tolerance
                    ),
                )
                .into());
            }
        }

        // d/dθ sum(z ⊙ g) = g^T dz/dθ for a constant seed g
        let seed_nk = grad_nk.narrow(0, span.start, span.len())?.detach();
        let surrogate = z_nk.mul(&seed_nk)?.sum_all()?;
        let chunk_grads = surrogate.backward()?;

        let nupdated = accumulator.accumulate(&params, &chunk_grads)?;
        debug!(
            "replayed sub-batch {} (rows {:?}), {} parameter gradients",
            i, span, nupdated
        );
    }

    Ok(())
}

/// Result of one optimization step
///
/// * `loss` - contrastive loss of the logical batch
/// * `grads` - gradients of every trainable parameter, ready for `Optimizer::step`
pub struct StepOutput {
    pub loss: f32,
    pub mesh_to_text_accuracy: f32,
    pub text_to_mesh_accuracy: f32,
    pub grads: GradStore,
}

impl StepOutput {
    fn new(evaluation: &ContrastiveEvaluation, grads: GradStore) -> anyhow::Result<Self> {
        Ok(Self {
            loss: evaluation
                .loss
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?,
            mesh_to_text_accuracy: evaluation.mesh_to_text_accuracy,
            text_to_mesh_accuracy: evaluation.text_to_mesh_accuracy,
            grads,
        })
    }
}

/// Two-encoder gradient cache
pub struct GradCache {
    config: GradCacheConfig,
}

impl GradCache {
    pub fn new(config: GradCacheConfig) -> anyhow::Result<Self> {
        if config.mesh_chunk_size == 0 || config.text_chunk_size == 0 {
            return Err(GradCacheError::InvalidChunkSize.into());
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &GradCacheConfig {
        &self.config
    }

    /// Gradients of the contrastive loss over the full logical batch
    /// while encoding at most one sub-batch at a time
    ///
    /// * `mesh_encoder`, `text_encoder` - encoders to differentiate
    /// * `criterion` - contrastive loss (its `logit_scale` also gets a gradient)
    /// * `meshes` - logical mesh batch (`BatchInput::Graphs`)
    /// * `descriptions` - logical description batch (`BatchInput::Rows`)
    /// * `association` - description-to-mesh mapping of the two batches
    pub fn step<MeshEnc, TextEnc>(
        &self,
        mesh_encoder: &MeshEnc,
        text_encoder: &TextEnc,
        criterion: &ContrastiveLoss,
        meshes: &BatchInput,
        descriptions: &BatchInput,
        association: &Association,
    ) -> anyhow::Result<StepOutput>
    where
        MeshEnc: ContrastiveEncoderT + Sync + ?Sized,
        TextEnc: ContrastiveEncoderT + Sync + ?Sized,
    {
        // 1. split
        association.check_rows(meshes.num_rows()?, descriptions.num_rows()?)?;
        let mesh_chunks = meshes.split(self.config.mesh_chunk_size)?;
        let text_chunks = descriptions.split(self.config.text_chunk_size)?;

        // 2. representations without activations
        let (mesh_cached, text_cached) = if self.config.parallel_cache_pass {
            let (mesh_cached, text_cached) = rayon::join(
                || cache_representations(mesh_encoder, mesh_chunks),
                || cache_representations(text_encoder, text_chunks),
            );
            (mesh_cached?, text_cached?)
        } else {
            (
                cache_representations(mesh_encoder, mesh_chunks)?,
                cache_representations(text_encoder, text_chunks)?,
            )
        };

        // 3. loss and representation gradients
        let evaluation = criterion.evaluate(
            mesh_cached.representation(),
            text_cached.representation(),
            association,
        )?;

        let mut accumulator = GradientAccumulator::new(evaluation.loss.backward()?);

        let grad_mesh = accumulator
            .remove(mesh_cached.representation())
            .ok_or_else(|| anyhow::anyhow!("no gradient reached the mesh representation"))?;
        let grad_text = accumulator
            .remove(text_cached.representation())
            .ok_or_else(|| anyhow::anyhow!("no gradient reached the text representation"))?;

        // 4. replay
        replay_gradients(
            mesh_encoder,
            mesh_cached,
            &grad_mesh,
            &mut accumulator,
            &self.config,
        )?;
        replay_gradients(
            text_encoder,
            text_cached,
            &grad_text,
            &mut accumulator,
            &self.config,
        )?;

        let output = StepOutput::new(&evaluation, accumulator.into_grad_store())?;

        info!(
            "grad-cache step: loss = {:.4}, acc(mesh->text) = {:.3}, acc(text->mesh) = {:.3}",
            output.loss, output.mesh_to_text_accuracy, output.text_to_mesh_accuracy
        );

        Ok(output)
    }
}

/// Reference step: encode both logical batches at once and
/// back-propagate the loss through everything in one pass
pub fn naive_step<MeshEnc, TextEnc>(
    mesh_encoder: &MeshEnc,
    text_encoder: &TextEnc,
    criterion: &ContrastiveLoss,
    meshes: &BatchInput,
    descriptions: &BatchInput,
    association: &Association,
) -> anyhow::Result<StepOutput>
where
    MeshEnc: ContrastiveEncoderT + ?Sized,
    TextEnc: ContrastiveEncoderT + ?Sized,
{
    association.check_rows(meshes.num_rows()?, descriptions.num_rows()?)?;

    let mesh_mk = mesh_encoder.forward_sub_batch(&meshes.as_sub_batch())?;
    let text_dk = text_encoder.forward_sub_batch(&descriptions.as_sub_batch())?;

    let evaluation = criterion.evaluate(&mesh_mk, &text_dk, association)?;
    let grads = evaluation.loss.backward()?;

    StepOutput::new(&evaluation, grads)
}
