use crate::association::Association;
use crate::batch_split::BatchInput;
use crate::error::GradCacheError;
use crate::mesh_graph::MeshGraph;
use crate::text_encoder::PAD_TOKEN;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};

/// A mesh with its tokenized descriptions
#[derive(Clone, Debug)]
pub struct AnnotatedMesh {
    pub mesh: MeshGraph,
    pub descriptions: Vec<Vec<u32>>,
}

impl AnnotatedMesh {
    pub fn new(mesh: MeshGraph, descriptions: Vec<Vec<u32>>) -> anyhow::Result<Self> {
        if descriptions.is_empty() {
            return Err(GradCacheError::InvalidMesh("mesh without any description".into()).into());
        }
        Ok(Self { mesh, descriptions })
    }
}

/// Everything one optimization step consumes
///
/// * `meshes` - `BatchInput::Graphs`, one graph per mesh
/// * `descriptions` - `BatchInput::Rows` of padded token ids, grouped by mesh
/// * `association` - description row -> mesh row
pub struct MeshTextBatch {
    pub meshes: BatchInput,
    pub descriptions: BatchInput,
    pub association: Association,
}

/// `DataLoader` for mesh/description minibatch learning
pub trait MeshTextDataLoader {
    /// Assemble minibatch `batch_idx`, sampling `descs_per_mesh`
    /// descriptions per mesh with replacement
    fn minibatch(
        &self,
        batch_idx: usize,
        descs_per_mesh: usize,
        target_device: &Device,
        rng: &mut StdRng,
    ) -> anyhow::Result<MeshTextBatch>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()>;
}

/// In-memory annotated meshes. Only complete minibatches are formed;
/// leftover meshes wait for the next shuffle.
pub struct InMemoryMeshTextData {
    items: Vec<AnnotatedMesh>,
    context_length: usize,
    chunks: Vec<Vec<usize>>,
}

impl InMemoryMeshTextData {
    /// * `items` - annotated meshes
    /// * `context_length` - token sequences are truncated or padded to this length
    pub fn new(items: Vec<AnnotatedMesh>, context_length: usize) -> anyhow::Result<Self> {
        if items.is_empty() {
            return Err(GradCacheError::EmptyBatch.into());
        }
        if context_length == 0 {
            anyhow::bail!("context length must be positive");
        }
        Ok(Self {
            items,
            context_length,
            chunks: vec![],
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }
}

/// truncate or pad a token sequence to `context_length`
fn padded(tokens: &[u32], context_length: usize) -> impl Iterator<Item = u32> + '_ {
    tokens
        .iter()
        .copied()
        .chain(std::iter::repeat(PAD_TOKEN))
        .take(context_length)
}

impl MeshTextDataLoader for InMemoryMeshTextData {
    fn minibatch(
        &self,
        batch_idx: usize,
        descs_per_mesh: usize,
        target_device: &Device,
        rng: &mut StdRng,
    ) -> anyhow::Result<MeshTextBatch> {
        let samples = self.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;

        if descs_per_mesh == 0 {
            anyhow::bail!("need at least one description per mesh");
        }

        let mut meshes = Vec::with_capacity(samples.len());
        let mut tokens = Vec::with_capacity(samples.len() * descs_per_mesh * self.context_length);

        for &i in samples {
            let item = &self.items[i];
            meshes.push(item.mesh.clone());
            for _ in 0..descs_per_mesh {
                let desc = item
                    .descriptions
                    .choose(rng)
                    .ok_or_else(|| anyhow::anyhow!("mesh {} has no description", i))?;
                tokens.extend(padded(desc, self.context_length));
            }
        }

        let ndesc = samples.len() * descs_per_mesh;
        let tokens = Tensor::from_vec(tokens, (ndesc, self.context_length), target_device)?;
        let association = Association::contiguous(&vec![descs_per_mesh; samples.len()])?;

        Ok(MeshTextBatch {
            meshes: BatchInput::Graphs(meshes),
            descriptions: BatchInput::Rows(tokens),
            association,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        let mut samples = (0..self.items.len()).collect::<Vec<_>>();
        samples.shuffle(rng);

        self.chunks = samples
            .chunks_exact(batch_size)
            .map(|c| c.to_vec())
            .collect();

        if self.chunks.is_empty() {
            anyhow::bail!(
                "{} meshes cannot fill a single minibatch of {}",
                self.items.len(),
                batch_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn corpus(n: usize) -> anyhow::Result<Vec<AnnotatedMesh>> {
        (0..n)
            .map(|i| {
                let mesh = MeshGraph::new(vec![[i as f32, 0., 0.]; 2], &[(0, 1)])?;
                let descs = (0..(i % 3 + 1))
                    .map(|j| vec![(10 * i + j + 1) as u32; j + 1])
                    .collect();
                AnnotatedMesh::new(mesh, descs)
            })
            .collect()
    }

    #[test]
    fn full_minibatches_only() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = InMemoryMeshTextData::new(corpus(7)?, 4)?;
        data.shuffle_minibatch(3, &mut rng)?;
        assert_eq!(data.num_minibatch(), 2);
        assert!(data.shuffle_minibatch(8, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn sampled_descriptions_belong_to_their_mesh() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut data = InMemoryMeshTextData::new(corpus(6)?, 3)?;
        data.shuffle_minibatch(3, &mut rng)?;

        let batch = data.minibatch(0, 2, &Device::Cpu, &mut rng)?;
        assert_eq!(batch.meshes.num_rows()?, 3);
        assert_eq!(batch.descriptions.num_rows()?, 6);
        assert_eq!(batch.association.num_descriptions(), 6);

        let (BatchInput::Graphs(meshes), BatchInput::Rows(tokens)) =
            (&batch.meshes, &batch.descriptions)
        else {
            anyhow::bail!("unexpected batch layout");
        };
        let tokens = tokens.to_vec2::<u32>()?;

        for (d, row) in tokens.iter().enumerate() {
            assert_eq!(row.len(), 3);
            let m = batch.association.mesh_of(d).unwrap_or(usize::MAX);
            let mesh_id = meshes[m].positions()[0][0] as usize;
            // description tokens were built as 10 * mesh_id + j + 1
            assert_eq!((row[0] as usize - 1) / 10, mesh_id);
        }
        assert!(data.minibatch(5, 2, &Device::Cpu, &mut rng).is_err());
        Ok(())
    }
}
