use crate::batch_split::SubBatch;

use candle_core::Tensor;

pub trait ContrastiveEncoderT {
    /// An encoder that maps one sub-batch to its representation rows
    ///
    /// # Arguments
    /// * `sub_batch` - a contiguous slice of the logical batch
    ///
    /// # Returns `z_nk`
    /// * `z_nk` - representation (n x k), one row per example, in input order
    ///
    /// Must be deterministic: the same sub-batch is encoded twice per
    /// optimization step and both results have to agree.
    fn forward_sub_batch(&self, sub_batch: &SubBatch) -> anyhow::Result<Tensor>;

    /// Trainable tensors; each one is the tensor of a `Var` in the
    /// caller's `VarMap`, so it keys the step's `GradStore`.
    fn parameters(&self) -> Vec<Tensor>;

    fn dim_embed(&self) -> usize;
}
