use crate::error::GradCacheError;

use candle_core::{DType, Device, Result, Tensor};

/// Many-to-many correspondence between meshes and descriptions.
///
/// Each description belongs to exactly one mesh; each mesh owns a
/// non-empty set of descriptions.
#[derive(Clone, Debug, PartialEq)]
pub struct Association {
    desc_to_mesh: Vec<usize>,
    mesh_to_descs: Vec<Vec<usize>>,
}

impl Association {
    /// * `desc_to_mesh` - mesh row of each description row
    /// * `num_meshes` - number of mesh rows
    pub fn new(desc_to_mesh: Vec<usize>, num_meshes: usize) -> anyhow::Result<Self> {
        let mut mesh_to_descs = vec![vec![]; num_meshes];
        for (d, &m) in desc_to_mesh.iter().enumerate() {
            if m >= num_meshes {
                return Err(GradCacheError::shape_mismatch(format!(
                    "description {} points to mesh {} (# meshes = {})",
                    d, m, num_meshes
                ))
                .into());
            }
            mesh_to_descs[m].push(d);
        }

        if let Some(m) = mesh_to_descs.iter().position(|descs| descs.is_empty()) {
            return Err(
                GradCacheError::shape_mismatch(format!("mesh {} has no description", m)).into(),
            );
        }

        Ok(Self {
            desc_to_mesh,
            mesh_to_descs,
        })
    }

    /// Descriptions grouped by mesh: the first `group_sizes[0]` rows
    /// describe mesh 0, the next `group_sizes[1]` mesh 1, and so on.
    pub fn contiguous(group_sizes: &[usize]) -> anyhow::Result<Self> {
        let desc_to_mesh = group_sizes
            .iter()
            .enumerate()
            .flat_map(|(m, &k)| std::iter::repeat_n(m, k))
            .collect();
        Self::new(desc_to_mesh, group_sizes.len())
    }

    pub fn num_meshes(&self) -> usize {
        self.mesh_to_descs.len()
    }

    pub fn num_descriptions(&self) -> usize {
        self.desc_to_mesh.len()
    }

    pub fn mesh_of(&self, desc: usize) -> Option<usize> {
        self.desc_to_mesh.get(desc).copied()
    }

    pub fn descriptions_of(&self, mesh: usize) -> &[usize] {
        self.mesh_to_descs
            .get(mesh)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Both logical batches must agree with the association
    pub fn check_rows(&self, mesh_rows: usize, desc_rows: usize) -> anyhow::Result<()> {
        if mesh_rows != self.num_meshes() || desc_rows != self.num_descriptions() {
            return Err(GradCacheError::shape_mismatch(format!(
                "batches have {} meshes x {} descriptions, association expects {} x {}",
                mesh_rows,
                desc_rows,
                self.num_meshes(),
                self.num_descriptions()
            ))
            .into());
        }
        Ok(())
    }

    /// uniform mass `1/|D(m)|` over the descriptions of each mesh (M x D)
    pub fn mesh_to_text_target(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let (mm, dd) = (self.num_meshes(), self.num_descriptions());
        let mut target = vec![0_f32; mm * dd];
        for (m, descs) in self.mesh_to_descs.iter().enumerate() {
            let w = 1. / descs.len() as f32;
            for &d in descs {
                target[m * dd + d] = w;
            }
        }
        Tensor::from_vec(target, (mm, dd), device)?.to_dtype(dtype)
    }

    /// one-hot on the owning mesh of each description (D x M)
    pub fn text_to_mesh_target(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let (mm, dd) = (self.num_meshes(), self.num_descriptions());
        let mut target = vec![0_f32; dd * mm];
        for (d, &m) in self.desc_to_mesh.iter().enumerate() {
            target[d * mm + m] = 1.;
        }
        Tensor::from_vec(target, (dd, mm), device)?.to_dtype(dtype)
    }
}
