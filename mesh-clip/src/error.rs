//! Errors raised by the gradient-caching engine.

use thiserror::Error;

/// Failures that abort one optimization step.
#[derive(Debug, Error)]
pub enum GradCacheError {
    /// A logical batch is neither a row tensor nor a list of graphs,
    /// or an encoder received the variant it cannot consume.
    #[error("unsupported input shape: {0}")]
    UnsupportedInputShape(String),

    #[error("chunk size must be positive")]
    InvalidChunkSize,

    #[error("logical batch has no rows")]
    EmptyBatch,

    /// Row counts disagree, or the association points outside a batch.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Cosine similarity is undefined for a zero-norm representation row.
    #[error("degenerate embedding: row {row} has norm {norm}")]
    DegenerateEmbedding { row: usize, norm: f64 },

    /// The replayed forward pass disagrees with the cached one.
    #[error("replay mismatch at sub-batch {sub_batch}: {reason}")]
    ReplayMismatch { sub_batch: usize, reason: String },

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

impl GradCacheError {
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedInputShape(msg.into())
    }

    pub fn replay_mismatch(sub_batch: usize, reason: impl Into<String>) -> Self {
        Self::ReplayMismatch {
            sub_batch,
            reason: reason.into(),
        }
    }
}
