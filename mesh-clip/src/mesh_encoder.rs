use crate::batch_split::SubBatch;
use crate::error::GradCacheError;
use crate::layers::linear_parameters;
use crate::mesh_graph::{GraphBatch, MeshGraph};
use crate::model_traits::ContrastiveEncoderT;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

#[derive(Clone, Debug)]
pub struct MeshEncoderConfig {
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub embed_dim: usize,
}

impl MeshEncoderConfig {
    /// hidden width = embed_dim / 2 with three message passing layers
    pub fn with_embed_dim(embed_dim: usize) -> Self {
        Self {
            hidden_dim: (embed_dim / 2).max(1),
            num_layers: 3,
            embed_dim,
        }
    }
}

/// One mean-aggregation message passing layer
///
/// h'(i) = elu( W_self h(i) + W_neigh mean_{j ~ i} h(j) )
struct SageLayer {
    lin_self: Linear,
    lin_neigh: Linear,
}

impl SageLayer {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin_self: candle_nn::linear(in_dim, out_dim, vb.pp("self"))?,
            lin_neigh: candle_nn::linear_no_bias(in_dim, out_dim, vb.pp("neigh"))?,
        })
    }

    fn forward(&self, h_nd: &Tensor, graph: &GraphBatch) -> Result<Tensor> {
        let agg_nd = graph.neighbour_mean(h_nd)?;
        self.lin_self
            .forward(h_nd)?
            .add(&self.lin_neigh.forward(&agg_nd)?)?
            .elu(1.)
    }
}

/// Mesh graph encoder: message passing over vertex positions,
/// mean pooling per graph, then a linear projection to the joint space.
pub struct MeshGraphEncoder {
    config: MeshEncoderConfig,
    layers: Vec<SageLayer>,
    proj: Linear,
    dtype: DType,
    device: Device,
}

impl MeshGraphEncoder {
    /// Will create a new mesh encoder with these variables:
    ///
    /// * `mp.{}.self.weight|bias`, `mp.{}.neigh.weight` where {} is the layer index
    /// * `proj.weight|bias`
    pub fn new(config: MeshEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.num_layers);
        let mut prev_dim = 3;
        for j in 0..config.num_layers {
            layers.push(SageLayer::new(
                prev_dim,
                config.hidden_dim,
                vb.pp("mp").pp(j),
            )?);
            prev_dim = config.hidden_dim;
        }

        let proj = candle_nn::linear(prev_dim, config.embed_dim, vb.pp("proj"))?;

        Ok(Self {
            dtype: vb.dtype(),
            device: vb.device().clone(),
            config,
            layers,
            proj,
        })
    }

    /// Encode a list of graphs into `G x embed_dim`
    pub fn forward_graphs(&self, graphs: &[MeshGraph]) -> anyhow::Result<Tensor> {
        let graph = GraphBatch::collate(graphs, self.dtype, &self.device)?;
        let mut h_nd = graph.positions.clone();
        for layer in self.layers.iter() {
            h_nd = layer.forward(&h_nd, &graph)?;
        }
        let pooled_gd = graph.pooling.matmul(&h_nd)?;
        Ok(self.proj.forward(&pooled_gd)?)
    }
}

impl ContrastiveEncoderT for MeshGraphEncoder {
    fn forward_sub_batch(&self, sub_batch: &SubBatch) -> anyhow::Result<Tensor> {
        match sub_batch {
            SubBatch::Graphs(graphs) => self.forward_graphs(graphs),
            SubBatch::Rows(_) => Err(GradCacheError::unsupported(
                "mesh encoder expects a list of graphs",
            )
            .into()),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers
            .iter()
            .flat_map(|l| {
                let mut ret = linear_parameters(&l.lin_self);
                ret.extend(linear_parameters(&l.lin_neigh));
                ret
            })
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
    use candle_nn::VarMap;

    fn square(offset: f32) -> anyhow::Result<MeshGraph> {
        MeshGraph::from_faces(
            vec![
                [offset, 0., 0.],
                [1. + offset, 0., 0.],
                [1. + offset, 1., 0.],
                [offset, 1., 0.5],
            ],
            &[[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn encode_graph_list() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = MeshGraphEncoder::new(MeshEncoderConfig::with_embed_dim(8), vb.pp("mesh"))?;

        assert_eq!(enc.parameters().len(), varmap.all_vars().len());

        let graphs = vec![square(0.)?, square(2.)?, MeshGraph::new(vec![[0.; 3]], &[])?];
        let z = enc.forward_sub_batch(&SubBatch::Graphs(&graphs))?;
        assert_eq!(z.dims(), &[3, 8]);

        // encoding one graph at a time gives the same rows
        let z1 = enc.forward_graphs(&graphs[1..2])?;
        let diff = (z.narrow(0, 1, 1)? - z1)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);

        let rows = SubBatch::Rows(Tensor::zeros((2, 3), DType::F32, &dev)?);
        assert!(enc.forward_sub_batch(&rows).is_err());
        Ok(())
    }
}
