use crate::batch_split::SubBatch;
use crate::error::GradCacheError;
use crate::layers::{linear_parameters, LayerStack};
use crate::model_traits::ContrastiveEncoderT;

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Activation, Embedding, Linear, Module, VarBuilder};

/// Token id reserved for padding
pub const PAD_TOKEN: u32 = 0;

#[derive(Clone, Debug)]
pub struct DescriptionEncoderConfig {
    pub vocab_size: usize,
    pub token_dim: usize,
    pub layers: Vec<usize>,
    pub embed_dim: usize,
}

/// Description encoder over padded token ids (n x L, `u32`)
///
/// embed tokens -> masked mean over positions -> fc stack -> projection
pub struct DescriptionEncoder {
    config: DescriptionEncoderConfig,
    emb_tokens: Embedding,
    fc: LayerStack,
    proj: Linear,
    dtype: DType,
}

impl DescriptionEncoder {
    /// Will create a new description encoder with these variables:
    ///
    /// * `embed_tokens.weight`
    /// * `fc.{}.weight|bias` where {} is the layer index
    /// * `proj.weight|bias`
    pub fn new(config: DescriptionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let emb_tokens =
            candle_nn::embedding(config.vocab_size, config.token_dim, vb.pp("embed_tokens"))?;

        let fc = LayerStack::build(config.token_dim, &config.layers, Activation::Relu, vb.pp("fc"))?;
        let prev_dim = fc.out_dim().unwrap_or(config.token_dim);
        let proj = candle_nn::linear(prev_dim, config.embed_dim, vb.pp("proj"))?;

        Ok(Self {
            dtype: vb.dtype(),
            config,
            emb_tokens,
            fc,
            proj,
        })
    }

    /// Encode token ids (n x L) into `n x embed_dim`
    pub fn forward_tokens(&self, tokens_nl: &Tensor) -> anyhow::Result<Tensor> {
        if tokens_nl.rank() != 2 || tokens_nl.dtype() != DType::U32 {
            return Err(GradCacheError::unsupported(format!(
                "description encoder expects u32 token ids (n x L), got {:?} {:?}",
                tokens_nl.dtype(),
                tokens_nl.dims()
            ))
            .into());
        }

        let mask_nl = tokens_nl.ne(PAD_TOKEN)?.to_dtype(self.dtype)?;
        let count_n1 = mask_nl.sum_keepdim(1)?.clamp(1., f64::INFINITY)?;

        let emb_nlk = self.emb_tokens.forward(tokens_nl)?;
        let pooled_nk = emb_nlk
            .broadcast_mul(&mask_nl.unsqueeze(D::Minus1)?)?
            .sum(1)?
            .broadcast_div(&count_n1)?;

        let h_nk = self.fc.forward(&pooled_nk)?;
        Ok(self.proj.forward(&h_nk)?)
    }
}

impl ContrastiveEncoderT for DescriptionEncoder {
    fn forward_sub_batch(&self, sub_batch: &SubBatch) -> anyhow::Result<Tensor> {
        match sub_batch {
            SubBatch::Rows(tokens_nl) => self.forward_tokens(tokens_nl),
            SubBatch::Graphs(_) => Err(GradCacheError::unsupported(
                "description encoder expects a token tensor",
            )
            .into()),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        std::iter::once(self.emb_tokens.embeddings().clone())
            .chain(self.fc.parameters())
            .chain(linear_parameters(&self.proj))
            .collect()
    }

    fn dim_embed(&self) -> usize {
        self.config.embed_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn encoder(varmap: &VarMap) -> Result<DescriptionEncoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        DescriptionEncoder::new(
            DescriptionEncoderConfig {
                vocab_size: 20,
                token_dim: 6,
                layers: vec![10],
                embed_dim: 4,
            },
            vb.pp("text"),
        )
    }

    #[test]
    fn padding_does_not_change_encoding() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let enc = encoder(&varmap)?;
        assert_eq!(enc.parameters().len(), varmap.all_vars().len());

        let dev = Device::Cpu;
        let short = Tensor::new(&[[3u32, 7, 9]], &dev)?;
        let padded = Tensor::new(&[[3u32, 7, 9, 0, 0], [5, 0, 0, 0, 0]], &dev)?;

        let z_short = enc.forward_tokens(&short)?;
        let z_padded = enc.forward_tokens(&padded)?;
        assert_eq!(z_padded.dims(), &[2, 4]);

        let diff = (z_short - z_padded.narrow(0, 0, 1)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn reject_wrong_inputs() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let enc = encoder(&varmap)?;
        let floats = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert!(enc.forward_sub_batch(&SubBatch::Rows(floats)).is_err());
        assert!(enc.forward_sub_batch(&SubBatch::Graphs(&[])).is_err());
        Ok(())
    }
}
