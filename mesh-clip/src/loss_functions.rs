use crate::error::GradCacheError;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;

/// Row-wise L2 norms of a representation matrix (n x 1)
pub fn row_norms(x_nk: &Tensor) -> Result<Tensor> {
    x_nk.sqr()?.sum_keepdim(1)?.sqrt()
}

/// Divide each row by its L2 norm
///
/// x(i,k) / sqrt( sum_k x(i,k)^2 )
///
/// A row with zero (or non-finite) norm makes the cosine similarity
/// undefined and fails with `DegenerateEmbedding` instead of producing
/// NaN entries.
pub fn l2_normalize_rows(x_nk: &Tensor) -> anyhow::Result<Tensor> {
    let norm_n1 = row_norms(x_nk)?;

    let norms = norm_n1
        .detach()
        .flatten_all()?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?;

    if let Some((row, &norm)) = norms
        .iter()
        .enumerate()
        .find(|&(_, &v)| !(v.is_finite() && v > 0.))
    {
        return Err(GradCacheError::DegenerateEmbedding { row, norm }.into());
    }

    Ok(x_nk.broadcast_div(&norm_n1)?)
}

/// Cross entropy against soft targets, averaged over rows
///
/// loss = - 1/n sum_i sum_j t(i,j) * log softmax(logits(i,:))_j
///
/// * `logits_nm` - unnormalized scores
/// * `target_nm` - target distributions (rows sum to one)
///
pub fn soft_cross_entropy(logits_nm: &Tensor, target_nm: &Tensor) -> Result<Tensor> {
    let log_prob_nm = ops::log_softmax(logits_nm, 1)?;
    target_nm.mul(&log_prob_nm)?.sum(1)?.mean(0)?.neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn normalized_rows_have_unit_norm() -> anyhow::Result<()> {
        let x = Tensor::new(&[[3f32, 4.], [0., -2.], [1., 1.]], &Device::Cpu)?;
        let norms = row_norms(&l2_normalize_rows(&x)?)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for n in norms {
            approx::assert_abs_diff_eq!(n, 1.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn zero_row_is_degenerate() -> anyhow::Result<()> {
        let x = Tensor::new(&[[3f32, 4.], [0., 0.]], &Device::Cpu)?;
        let err = l2_normalize_rows(&x).unwrap_err();
        match err.downcast_ref::<GradCacheError>() {
            Some(GradCacheError::DegenerateEmbedding { row, .. }) => assert_eq!(*row, 1),
            _ => panic!("unexpected error: {}", err),
        }
        Ok(())
    }

    #[test]
    fn cross_entropy_matches_hand_computation() -> Result<()> {
        let logits = Tensor::new(&[[0f32, 0.], [2f32.ln(), 0.]], &Device::Cpu)?;
        let target = Tensor::new(&[[0.5f32, 0.5], [1., 0.]], &Device::Cpu)?;
        let loss = soft_cross_entropy(&logits, &target)?.to_scalar::<f32>()?;
        // row 0: ln 2, row 1: -ln(2/3)
        let expected = (2f32.ln() + (1.5f32).ln()) / 2.;
        approx::assert_abs_diff_eq!(loss, expected, epsilon = 1e-6);
        Ok(())
    }
}
