use crate::error::GradCacheError;
use crate::mesh_graph::MeshGraph;

use candle_core::Tensor;
use std::ops::Range;

/// One logical batch for one encoder
pub enum BatchInput {
    /// a flat tensor whose leading dimension indexes examples
    Rows(Tensor),
    /// independently structured graphs, one per example
    Graphs(Vec<MeshGraph>),
}

/// A contiguous slice of a [`BatchInput`]. Row slices are views on
/// the same storage; graph slices borrow the logical batch.
#[derive(Clone, Debug)]
pub enum SubBatch<'a> {
    Rows(Tensor),
    Graphs(&'a [MeshGraph]),
}

impl SubBatch<'_> {
    pub fn num_rows(&self) -> usize {
        match self {
            SubBatch::Rows(x) => x.dims().first().copied().unwrap_or(0),
            SubBatch::Graphs(graphs) => graphs.len(),
        }
    }
}

impl BatchInput {
    pub fn num_rows(&self) -> anyhow::Result<usize> {
        match self {
            BatchInput::Rows(x) => {
                if x.rank() == 0 {
                    return Err(GradCacheError::unsupported(
                        "a scalar tensor has no leading dimension to split",
                    )
                    .into());
                }
                Ok(x.dim(0)?)
            }
            BatchInput::Graphs(graphs) => Ok(graphs.len()),
        }
    }

    /// Split into contiguous sub-batches of at most `chunk_size` rows
    /// without reordering. Concatenating them reproduces the batch.
    pub fn split(&self, chunk_size: usize) -> anyhow::Result<Vec<SubBatch<'_>>> {
        let nrows = self.num_rows()?;
        if nrows == 0 {
            return Err(GradCacheError::EmptyBatch.into());
        }

        let spans = chunk_spans(nrows, chunk_size)?;

        match self {
            BatchInput::Rows(x) => spans
                .into_iter()
                .map(|r| Ok(SubBatch::Rows(x.narrow(0, r.start, r.len())?)))
                .collect(),
            BatchInput::Graphs(graphs) => Ok(spans
                .into_iter()
                .map(|r| SubBatch::Graphs(&graphs[r]))
                .collect()),
        }
    }

    /// The whole batch as a single sub-batch
    pub fn as_sub_batch(&self) -> SubBatch<'_> {
        match self {
            BatchInput::Rows(x) => SubBatch::Rows(x.clone()),
            BatchInput::Graphs(graphs) => SubBatch::Graphs(graphs),
        }
    }
}

/// `[lo, hi)` row ranges of `ceil(nrows / chunk_size)` chunks
pub fn chunk_spans(nrows: usize, chunk_size: usize) -> anyhow::Result<Vec<Range<usize>>> {
    if chunk_size == 0 {
        return Err(GradCacheError::InvalidChunkSize.into());
    }
    Ok((0..nrows)
        .step_by(chunk_size)
        .map(|lb| lb..(lb + chunk_size).min(nrows))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn chunk_sizes() -> anyhow::Result<()> {
        for nn in 1..12 {
            for cs in 1..=(nn + 2) {
                let spans = chunk_spans(nn, cs)?;
                assert_eq!(spans.len(), nn.div_ceil(cs));

                let last = spans.last().map(|r| r.len()).unwrap_or(0);
                let expected_last = if nn % cs == 0 { cs.min(nn) } else { nn % cs };
                assert_eq!(last, expected_last);

                for r in &spans[..spans.len() - 1] {
                    assert_eq!(r.len(), cs);
                }
                assert_eq!(spans.iter().map(|r| r.len()).sum::<usize>(), nn);
            }
        }
        Ok(())
    }

    #[test]
    fn split_rows_preserves_order() -> anyhow::Result<()> {
        let x = Tensor::arange(0u32, 14u32, &Device::Cpu)?.reshape((7, 2))?;
        let batch = BatchInput::Rows(x.clone());
        let chunks = batch.split(3)?;
        assert_eq!(
            chunks.iter().map(SubBatch::num_rows).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );

        let parts = chunks
            .iter()
            .map(|sb| match sb {
                SubBatch::Rows(t) => Ok(t.clone()),
                SubBatch::Graphs(_) => anyhow::bail!("expected rows"),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let y = Tensor::cat(&parts, 0)?;
        assert_eq!(x.to_vec2::<u32>()?, y.to_vec2::<u32>()?);
        Ok(())
    }

    #[test]
    fn split_graphs_preserves_order() -> anyhow::Result<()> {
        let graphs = (0..5)
            .map(|i| MeshGraph::new(vec![[i as f32, 0., 0.]; i + 1], &[]))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let batch = BatchInput::Graphs(graphs.clone());

        let chunks = batch.split(2)?;
        assert_eq!(chunks.len(), 3);

        let rejoined = chunks
            .iter()
            .flat_map(|sb| match sb {
                SubBatch::Graphs(g) => g.to_vec(),
                SubBatch::Rows(_) => vec![],
            })
            .collect::<Vec<_>>();
        assert_eq!(rejoined, graphs);
        Ok(())
    }

    #[test]
    fn unsupported_and_empty() -> anyhow::Result<()> {
        let scalar = BatchInput::Rows(Tensor::new(1f32, &Device::Cpu)?);
        let err = scalar.split(2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GradCacheError>(),
            Some(GradCacheError::UnsupportedInputShape(_))
        ));

        let empty = BatchInput::Rows(Tensor::zeros((0, 4), DType::U32, &Device::Cpu)?);
        let err = empty.split(2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GradCacheError>(),
            Some(GradCacheError::EmptyBatch)
        ));

        let rows = BatchInput::Rows(Tensor::zeros((3, 4), DType::U32, &Device::Cpu)?);
        let err = rows.split(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GradCacheError>(),
            Some(GradCacheError::InvalidChunkSize)
        ));
        Ok(())
    }
}
