use crate::data_loader::AnnotatedMesh;
use crate::mesh_graph::MeshGraph;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Shape of a synthetic corpus
///
/// * `num_meshes` - total annotated meshes
/// * `num_classes` - shape families; descriptions share words within a family
/// * `vocab_size` - token ids are drawn from `1..vocab_size`
/// * `descs_per_mesh` - distinct descriptions written for each mesh
/// * `desc_length` - max tokens per description
/// * `noise` - standard deviation of the vertex jitter
#[derive(Clone, Debug)]
pub struct SyntheticCorpusArgs {
    pub num_meshes: usize,
    pub num_classes: usize,
    pub vocab_size: usize,
    pub descs_per_mesh: usize,
    pub desc_length: usize,
    pub noise: f32,
}

/// A closed ring of `n` vertices with extra chords every `stride`
/// vertices, lifted into a helix of height `pitch`
fn ring_with_chords(
    n: usize,
    stride: usize,
    radius: f32,
    pitch: f32,
    jitter: &Normal<f32>,
    rng: &mut StdRng,
) -> anyhow::Result<MeshGraph> {
    let positions = (0..n)
        .map(|i| {
            let t = i as f32 / n as f32 * std::f32::consts::TAU;
            [
                radius * t.cos() + jitter.sample(rng),
                radius * t.sin() + jitter.sample(rng),
                pitch * t + jitter.sample(rng),
            ]
        })
        .collect();

    let mut edges = (0..n).map(|i| (i, (i + 1) % n)).collect::<Vec<_>>();
    if stride > 1 {
        edges.extend((0..n).step_by(stride).map(|i| (i, (i + n / 2) % n)));
    }
    MeshGraph::new(positions, &edges)
}

/// Generate meshes whose geometry and descriptions both depend on a
/// hidden class, so that matching them is learnable.
pub fn generate_corpus(
    args: &SyntheticCorpusArgs,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<AnnotatedMesh>> {
    if args.num_classes == 0 || args.descs_per_mesh == 0 || args.desc_length == 0 {
        anyhow::bail!("empty synthetic corpus: {:?}", args);
    }

    // every class owns a band of words; the rest is shared filler
    let words_per_class = (args.vocab_size.saturating_sub(1) / (args.num_classes + 1)).max(1);
    let num_filler = args.vocab_size.saturating_sub(1 + words_per_class * args.num_classes);
    if args.vocab_size <= words_per_class * args.num_classes {
        anyhow::bail!(
            "vocabulary of {} cannot hold {} classes",
            args.vocab_size,
            args.num_classes
        );
    }

    let jitter = Normal::new(0_f32, args.noise).map_err(|e| anyhow::anyhow!("{}", e))?;

    (0..args.num_meshes)
        .map(|i| {
            let class = i % args.num_classes;
            let n = 6 + 2 * class + rng.random_range(0..3);
            let radius = 1. + class as f32 * 0.5;
            let mesh = ring_with_chords(n, class + 1, radius, 0.1 * class as f32, &jitter, rng)?;

            let class_word = |rng: &mut StdRng| {
                (1 + class * words_per_class + rng.random_range(0..words_per_class)) as u32
            };
            let filler_lb = 1 + words_per_class * args.num_classes;

            let descriptions = (0..args.descs_per_mesh)
                .map(|_| {
                    let len = rng.random_range(1..=args.desc_length);
                    (0..len)
                        .map(|_| {
                            if num_filler > 0 && rng.random_bool(0.3) {
                                (filler_lb + rng.random_range(0..num_filler)) as u32
                            } else {
                                class_word(rng)
                            }
                        })
                        .collect::<Vec<_>>()
                })
                .collect();

            AnnotatedMesh::new(mesh, descriptions)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text_encoder::PAD_TOKEN;
    use rand::SeedableRng;

    #[test]
    fn tokens_stay_inside_the_vocabulary() -> anyhow::Result<()> {
        let args = SyntheticCorpusArgs {
            num_meshes: 12,
            num_classes: 3,
            vocab_size: 40,
            descs_per_mesh: 4,
            desc_length: 6,
            noise: 0.05,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let corpus = generate_corpus(&args, &mut rng)?;
        assert_eq!(corpus.len(), 12);

        for item in &corpus {
            assert_eq!(item.descriptions.len(), 4);
            assert!(item.mesh.num_nodes() >= 6);
            assert!(item.mesh.num_edges() >= item.mesh.num_nodes());
            for desc in &item.descriptions {
                assert!(!desc.is_empty() && desc.len() <= 6);
                assert!(desc.iter().all(|&t| t != PAD_TOKEN && (t as usize) < 40));
            }
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_corpus() -> anyhow::Result<()> {
        let args = SyntheticCorpusArgs {
            num_meshes: 5,
            num_classes: 2,
            vocab_size: 16,
            descs_per_mesh: 2,
            desc_length: 3,
            noise: 0.1,
        };
        let a = generate_corpus(&args, &mut StdRng::seed_from_u64(9))?;
        let b = generate_corpus(&args, &mut StdRng::seed_from_u64(9))?;
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.mesh, y.mesh);
            assert_eq!(x.descriptions, y.descriptions);
        }
        Ok(())
    }
}
