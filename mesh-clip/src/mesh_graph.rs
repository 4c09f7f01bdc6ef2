use crate::error::GradCacheError;

use candle_core::{DType, Device, Tensor};

/// A triangle mesh viewed as an undirected graph over its vertices.
///
/// Node features are the vertex positions `(x, y, z)`. Edges are
/// stored once per undirected pair with `lo < hi`.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshGraph {
    positions: Vec<[f32; 3]>,
    edges: Vec<(u32, u32)>,
}

impl MeshGraph {
    /// Build a graph from vertex positions and an edge list
    ///
    /// * `positions` - vertex coordinates
    /// * `edges` - pairs of vertex indexes (self loops and duplicates are dropped)
    pub fn new(positions: Vec<[f32; 3]>, edges: &[(usize, usize)]) -> anyhow::Result<Self> {
        let nn = positions.len();
        if nn == 0 {
            return Err(GradCacheError::InvalidMesh("no vertices".into()).into());
        }
        if nn > u32::MAX as usize {
            return Err(GradCacheError::InvalidMesh(format!("{} vertices", nn)).into());
        }

        let mut undirected = Vec::with_capacity(edges.len());
        for &(a, b) in edges {
            if a >= nn || b >= nn {
                return Err(GradCacheError::InvalidMesh(format!(
                    "edge ({}, {}) references a missing vertex (# vertices = {})",
                    a, b, nn
                ))
                .into());
            }
            if a != b {
                undirected.push((a.min(b) as u32, a.max(b) as u32));
            }
        }
        undirected.sort_unstable();
        undirected.dedup();

        Ok(Self {
            positions,
            edges: undirected,
        })
    }

    /// Build a graph from triangle faces; every face side becomes an edge
    pub fn from_faces(positions: Vec<[f32; 3]>, faces: &[[usize; 3]]) -> anyhow::Result<Self> {
        let edges = faces
            .iter()
            .flat_map(|&[a, b, c]| [(a, b), (b, c), (c, a)])
            .collect::<Vec<_>>();
        Self::new(positions, &edges)
    }

    pub fn num_nodes(&self) -> usize {
        self.positions.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    pub fn edges(&self) -> &[(u32, u32)] {
        &self.edges
    }
}

/// Several graphs collated into one block-diagonal graph
///
/// * `positions` - stacked node features (N x 3)
/// * `source`, `target` - directed message edges (both directions of each undirected edge)
/// * `inv_degree` - 1 / max(1, in-degree) per node (N x 1)
/// * `pooling` - mean-pooling operator (G x N)
pub struct GraphBatch {
    pub positions: Tensor,
    pub source: Option<Tensor>,
    pub target: Option<Tensor>,
    pub inv_degree: Tensor,
    pub pooling: Tensor,
}

impl GraphBatch {
    pub fn collate(graphs: &[MeshGraph], dtype: DType, device: &Device) -> anyhow::Result<Self> {
        let ngraph = graphs.len();
        let ntot: usize = graphs.iter().map(MeshGraph::num_nodes).sum();

        let mut positions = Vec::with_capacity(ntot * 3);
        let mut source = vec![];
        let mut target = vec![];
        let mut degree = vec![0_f32; ntot];
        let mut pooling = vec![0_f32; ngraph * ntot];

        let mut offset = 0_usize;
        for (g, graph) in graphs.iter().enumerate() {
            let nn = graph.num_nodes();
            positions.extend(graph.positions().iter().flatten().copied());

            for &(a, b) in graph.edges() {
                let (a, b) = (a + offset as u32, b + offset as u32);
                source.extend([a, b]);
                target.extend([b, a]);
                degree[a as usize] += 1.;
                degree[b as usize] += 1.;
            }

            let w = 1. / nn as f32;
            for j in offset..(offset + nn) {
                pooling[g * ntot + j] = w;
            }
            offset += nn;
        }

        let inv_degree = degree
            .into_iter()
            .map(|d| 1. / d.max(1.))
            .collect::<Vec<f32>>();

        let (source, target) = if source.is_empty() {
            (None, None)
        } else {
            let ne = source.len();
            (
                Some(Tensor::from_vec(source, ne, device)?),
                Some(Tensor::from_vec(target, ne, device)?),
            )
        };

        Ok(Self {
            positions: Tensor::from_vec(positions, (ntot, 3), device)?.to_dtype(dtype)?,
            source,
            target,
            inv_degree: Tensor::from_vec(inv_degree, (ntot, 1), device)?.to_dtype(dtype)?,
            pooling: Tensor::from_vec(pooling, (ngraph, ntot), device)?.to_dtype(dtype)?,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.positions.dims()[0]
    }

    /// mean of each node's neighbours: h_agg(i) = 1/deg(i) * sum_{j ~ i} h(j)
    pub fn neighbour_mean(&self, h_nd: &Tensor) -> candle_core::Result<Tensor> {
        match (&self.source, &self.target) {
            (Some(src), Some(tgt)) => {
                let messages = h_nd.index_select(src, 0)?;
                h_nd.zeros_like()?
                    .index_add(tgt, &messages, 0)?
                    .broadcast_mul(&self.inv_degree)
            }
            _ => h_nd.zeros_like(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> anyhow::Result<MeshGraph> {
        MeshGraph::from_faces(
            vec![[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]],
            &[[0, 1, 2]],
        )
    }

    #[test]
    fn faces_to_undirected_edges() -> anyhow::Result<()> {
        let g = triangle()?;
        assert_eq!(g.num_nodes(), 3);
        assert_eq!(g.edges(), &[(0, 1), (0, 2), (1, 2)]);

        let g = MeshGraph::new(vec![[0.; 3]; 2], &[(1, 0), (0, 1), (1, 1)])?;
        assert_eq!(g.edges(), &[(0, 1)]);
        Ok(())
    }

    #[test]
    fn reject_invalid_meshes() {
        assert!(MeshGraph::new(vec![], &[]).is_err());
        let err = MeshGraph::new(vec![[0.; 3]; 2], &[(0, 2)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GradCacheError>(),
            Some(GradCacheError::InvalidMesh(_))
        ));
    }

    #[test]
    fn collate_block_diagonal() -> anyhow::Result<()> {
        let single = MeshGraph::new(vec![[1., 2., 3.]], &[])?;
        let graphs = vec![triangle()?, single];
        let batch = GraphBatch::collate(&graphs, DType::F32, &Device::Cpu)?;

        assert_eq!(batch.num_nodes(), 4);
        assert_eq!(batch.pooling.dims(), &[2, 4]);

        let pool = batch.pooling.to_vec2::<f32>()?;
        approx::assert_abs_diff_eq!(pool[0][..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_eq!(pool[0][3], 0.);
        assert_eq!(pool[1], vec![0., 0., 0., 1.]);

        let h = batch.positions.clone();
        let agg = batch.neighbour_mean(&h)?.to_vec2::<f32>()?;
        // vertex 0 of the triangle sees vertices 1 and 2
        assert_eq!(agg[0], vec![0.5, 0.5, 0.]);
        // isolated vertex gets nothing
        assert_eq!(agg[3], vec![0., 0., 0.]);
        Ok(())
    }
}
