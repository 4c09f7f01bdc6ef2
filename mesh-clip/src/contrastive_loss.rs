use crate::association::Association;
use crate::error::GradCacheError;
use crate::loss_functions::{l2_normalize_rows, soft_cross_entropy};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// CLIP temperature at initialization: logit_scale = ln(1 / 0.07)
pub const INIT_LOGIT_SCALE: f64 = 2.659_260_036_932_778;

/// Symmetric many-to-many contrastive loss with a learned temperature
pub struct ContrastiveLoss {
    logit_scale: Tensor,
}

/// What one loss evaluation produces
///
/// * `loss` - scalar, differentiable w.r.t. both representations and `logit_scale`
/// * `logits_mesh_to_text` - detached scores (M x D)
/// * `mesh_to_text_accuracy` - fraction of meshes whose best description is their own
/// * `text_to_mesh_accuracy` - fraction of descriptions whose best mesh is their owner
pub struct ContrastiveEvaluation {
    pub loss: Tensor,
    pub logits_mesh_to_text: Tensor,
    pub mesh_to_text_accuracy: f32,
    pub text_to_mesh_accuracy: f32,
}

impl ContrastiveLoss {
    /// Will create the scalar variable `logit_scale`
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let logit_scale =
            vb.get_with_hints((), "logit_scale", candle_nn::Init::Const(INIT_LOGIT_SCALE))?;
        Ok(Self { logit_scale })
    }

    pub fn logit_scale(&self) -> &Tensor {
        &self.logit_scale
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        vec![self.logit_scale.clone()]
    }

    /// Scaled cosine similarities
    ///
    /// logits(m,d) = exp(logit_scale) * <mesh(m)/|mesh(m)|, text(d)/|text(d)|>
    ///
    /// # Returns `(logits_md, logits_dm)` where `logits_dm` is the transpose
    pub fn logits(&self, mesh_mk: &Tensor, text_dk: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let (mesh_dim, text_dim) = (mesh_mk.dims(), text_dk.dims());
        if mesh_dim.len() != 2 || text_dim.len() != 2 || mesh_dim[1] != text_dim[1] {
            return Err(GradCacheError::shape_mismatch(format!(
                "representations {:?} and {:?} do not share an embedding space",
                mesh_dim, text_dim
            ))
            .into());
        }

        let mesh_mk = l2_normalize_rows(mesh_mk)?;
        let text_dk = l2_normalize_rows(text_dk)?;

        let scale = self.logit_scale.exp()?;
        let logits_md = mesh_mk.matmul(&text_dk.t()?)?.broadcast_mul(&scale)?;
        let logits_dm = logits_md.t()?;
        Ok((logits_md, logits_dm))
    }

    /// Average of the mesh-to-text and text-to-mesh cross entropies
    ///
    /// * `mesh_mk` - mesh representations, rows in mesh batch order
    /// * `text_dk` - description representations, rows in description batch order
    /// * `association` - which descriptions belong to which mesh
    pub fn evaluate(
        &self,
        mesh_mk: &Tensor,
        text_dk: &Tensor,
        association: &Association,
    ) -> anyhow::Result<ContrastiveEvaluation> {
        association.check_rows(mesh_mk.dim(0)?, text_dk.dim(0)?)?;

        let (logits_md, logits_dm) = self.logits(mesh_mk, text_dk)?;

        let (dtype, device) = (logits_md.dtype(), logits_md.device());
        let target_md = association.mesh_to_text_target(dtype, device)?;
        let target_dm = association.text_to_mesh_target(dtype, device)?;

        let loss_mesh = soft_cross_entropy(&logits_md, &target_md)?;
        let loss_text = soft_cross_entropy(&logits_dm, &target_dm)?;
        let loss = ((loss_mesh + loss_text)? * 0.5)?;

        let logits_md = logits_md.detach();
        let (mesh_to_text_accuracy, text_to_mesh_accuracy) =
            retrieval_accuracy(&logits_md, association)?;

        Ok(ContrastiveEvaluation {
            loss,
            logits_mesh_to_text: logits_md,
            mesh_to_text_accuracy,
            text_to_mesh_accuracy,
        })
    }
}

/// Top-1 retrieval accuracy in both directions
pub fn retrieval_accuracy(logits_md: &Tensor, association: &Association) -> Result<(f32, f32)> {
    let best_desc = logits_md.argmax(1)?.to_vec1::<u32>()?;
    let best_mesh = logits_md.argmax(0)?.to_vec1::<u32>()?;

    let mesh_hits = best_desc
        .iter()
        .enumerate()
        .filter(|&(m, &d)| association.mesh_of(d as usize) == Some(m))
        .count();

    let text_hits = best_mesh
        .iter()
        .enumerate()
        .filter(|&(d, &m)| association.mesh_of(d) == Some(m as usize))
        .count();

    Ok((
        mesh_hits as f32 / best_desc.len().max(1) as f32,
        text_hits as f32 / best_mesh.len().max(1) as f32,
    ))
}
