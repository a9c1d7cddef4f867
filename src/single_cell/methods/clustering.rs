use faer::MatRef;
use rayon::prelude::*;
use serde::Deserialize;
use std::fmt;
use std::time::Instant;

use crate::core::base::pca_svd::run_pca;
use crate::core::data::sparse_structures::CountMatrix;
use crate::core::graph::community_detection::louvain_sparse_graph;
use crate::core::graph::knn::KnnSearch;
use crate::error::QcResult;
use crate::single_cell::processing::{expressed_genes, log_normalised_dense};
use crate::single_cell::sc_knn_snn::{build_snn_graph, SnnSimilarityMethod};
use crate::utils::general::group_by_label;

////////////
// Params //
////////////

/// Structure to store the graph clustering parameters
///
/// ### Fields
///
/// **Embedding:**
///
/// * `n_pcs` - Number of principal components; capped at the number of cells
///   minus one.
/// * `random_svd` - Use the randomised SVD.
///
/// **Graph:**
///
/// * `k` - Number of nearest neighbours for the SNN graph.
/// * `snn_method` - Edge weighting of the SNN graph.
/// * `knn_method` - Exact or approximate (HNSW) neighbour search.
///
/// **Community detection:**
///
/// * `resolution` - Resolution of the Louvain modularity.
/// * `louvain_iters` - Maximum sweeps of the Louvain local moving phase.
/// * `min_cells_to_subcluster` - Clusters with fewer cells are not
///   sub-clustered (they become a single sub-cluster).
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    // embedding
    pub n_pcs: usize,
    pub random_svd: bool,
    // graph
    pub k: usize,
    pub snn_method: SnnSimilarityMethod,
    pub knn_method: KnnSearch,
    // community detection
    pub resolution: f32,
    pub louvain_iters: usize,
    pub min_cells_to_subcluster: usize,
    pub seed: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            n_pcs: 50,
            random_svd: false,
            k: 10,
            snn_method: SnnSimilarityMethod::Rank,
            knn_method: KnnSearch::Exact,
            resolution: 1.0,
            louvain_iters: 25,
            min_cells_to_subcluster: 20,
            seed: 42,
        }
    }
}

////////////////
// Structures //
////////////////

/// Composite label of a sub-cluster within its parent cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubClusterKey {
    pub cluster: usize,
    pub sub_cluster: usize,
}

impl fmt::Display for SubClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.sub_cluster)
    }
}

/// Clustering layers of one sample
///
/// ### Fields
///
/// * `clusters` - Layer-1 cluster per cell of the sample.
/// * `sub_clusters` - Layer-2 key per cell; `sub_clusters[i].cluster`
///   always equals `clusters[i]`.
#[derive(Clone, Debug)]
pub struct SampleClustering {
    pub clusters: Vec<usize>,
    pub sub_clusters: Vec<SubClusterKey>,
}

impl SampleClustering {
    /// Number of Layer-1 clusters
    pub fn n_clusters(&self) -> usize {
        self.clusters.iter().max().map(|m| m + 1).unwrap_or(0)
    }
}

///////////////
// Functions //
///////////////

/// Partition an embedding via SNN graph and Louvain
///
/// ### Params
///
/// * `embd` - Cells x dimensions.
/// * `params` - The `ClusterParams`.
///
/// ### Returns
///
/// Cluster label per cell, numbered from zero.
pub fn cluster_embedding(embd: MatRef<f32>, params: &ClusterParams) -> Vec<usize> {
    let n = embd.nrows();
    if n < 3 {
        return vec![0; n];
    }
    let graph = build_snn_graph(
        embd,
        params.k,
        params.snn_method,
        params.knn_method,
        params.seed,
    );
    louvain_sparse_graph(
        &graph,
        params.resolution,
        params.louvain_iters,
        params.seed,
    )
}

/// Cluster a set of cells on their log-expression
///
/// The embedding is a PCA over all genes expressed in the cells.
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells to cluster.
/// * `size_factors` - Size factor per cell of the full dataset.
/// * `params` - The `ClusterParams`.
///
/// ### Returns
///
/// Cluster label per cell (in the order of `cells`).
pub fn cluster_log_expression(
    counts: &CountMatrix,
    cells: &[usize],
    size_factors: &[f64],
    params: &ClusterParams,
) -> QcResult<Vec<usize>> {
    if cells.len() < 3 {
        return Ok(vec![0; cells.len()]);
    }
    let genes = expressed_genes(counts, cells);
    if genes.is_empty() {
        return Ok(vec![0; cells.len()]);
    }
    let log_expr = log_normalised_dense(counts, cells, &genes, size_factors);
    let pca = run_pca(
        log_expr.as_ref(),
        params.n_pcs,
        false,
        params.random_svd,
        params.seed,
    )?;
    Ok(cluster_embedding(pca.scores.as_ref(), params))
}

/// Layer-1 and Layer-2 clustering of one sample
///
/// Every Layer-1 cluster with at least `min_cells_to_subcluster` cells is
/// re-clustered on its own cells.
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells of the sample.
/// * `size_factors` - Size factor per cell of the full dataset.
/// * `params` - The `ClusterParams`.
///
/// ### Returns
///
/// The `SampleClustering`
pub fn cluster_sample(
    counts: &CountMatrix,
    cells: &[usize],
    size_factors: &[f64],
    params: &ClusterParams,
) -> QcResult<SampleClustering> {
    let start = Instant::now();

    let clusters = cluster_log_expression(counts, cells, size_factors, params)?;
    let members = group_by_label(&clusters);

    let refined: Vec<(usize, Vec<usize>, Vec<usize>)> = members
        .into_par_iter()
        .map(|(cluster, positions)| -> QcResult<(usize, Vec<usize>, Vec<usize>)> {
            let sub = if positions.len() >= params.min_cells_to_subcluster {
                let sub_cells: Vec<usize> = positions.iter().map(|&p| cells[p]).collect();
                cluster_log_expression(counts, &sub_cells, size_factors, params)?
            } else {
                vec![0; positions.len()]
            };
            Ok((cluster, positions, sub))
        })
        .collect::<QcResult<Vec<_>>>()?;

    let mut sub_clusters = vec![
        SubClusterKey {
            cluster: 0,
            sub_cluster: 0
        };
        cells.len()
    ];
    for (cluster, positions, sub) in refined {
        for (p, s) in positions.into_iter().zip(sub) {
            sub_clusters[p] = SubClusterKey {
                cluster,
                sub_cluster: s,
            };
        }
    }

    let res = SampleClustering {
        clusters,
        sub_clusters,
    };

    log::debug!(
        "Clustered {} cells into {} clusters. Done in {:.2?}",
        cells.len(),
        res.n_clusters(),
        start.elapsed()
    );

    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::*;
    use faer::Mat;
    use std::collections::{BTreeMap, BTreeSet};

    fn params() -> ClusterParams {
        ClusterParams {
            k: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_embedding_with_two_groups() {
        let embd = Mat::from_fn(30, 2, |i, j| {
            let offset = if i < 15 { 0.0 } else { 50.0 };
            offset + ((i * 13 + j * 7) % 10) as f32 * 0.1
        });
        let labels = cluster_embedding(embd.as_ref(), &params());
        assert!(labels[..15].iter().all(|&l| l == labels[0]));
        assert!(labels[15..].iter().all(|&l| l == labels[15]));
        assert_ne!(labels[0], labels[15]);
    }

    #[test]
    fn test_tiny_scopes_are_one_cluster() {
        let embd = Mat::<f32>::zeros(2, 3);
        assert_eq!(cluster_embedding(embd.as_ref(), &params()), vec![0, 0]);
    }

    #[test]
    fn test_sample_partition_and_refinement() {
        let config = SyntheticSampleConfig::default();
        let sample = create_celltype_sparse_csr_data(&config);
        let sf = vec![1.0; sample.n_cells()];
        let cells: Vec<usize> = (0..sample.n_cells()).collect();

        let res = cluster_sample(&sample.counts, &cells, &sf, &params()).unwrap();
        assert_eq!(res.clusters.len(), cells.len());
        assert_eq!(res.sub_clusters.len(), cells.len());

        // partition: sizes sum to the sample size
        let sizes = group_by_label(&res.clusters);
        assert_eq!(sizes.values().map(|v| v.len()).sum::<usize>(), cells.len());

        // refinement: every sub-cluster sits in exactly one parent
        let mut parents: BTreeMap<SubClusterKey, BTreeSet<usize>> = BTreeMap::new();
        for (key, &c) in res.sub_clusters.iter().zip(res.clusters.iter()) {
            assert_eq!(key.cluster, c);
            parents.entry(*key).or_default().insert(c);
        }
        assert!(parents.values().all(|p| p.len() == 1));

        // the seven cell types are recovered at Layer 1
        let mut type_to_cluster: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (ct, &c) in sample.cell_types.iter().zip(res.clusters.iter()) {
            if let Some(ct) = ct {
                type_to_cluster.entry(*ct).or_default().insert(c);
            }
        }
        assert!(type_to_cluster.values().all(|c| c.len() == 1));
        assert_eq!(res.n_clusters(), 7);
    }

    #[test]
    fn test_sub_cluster_key_display() {
        let key = SubClusterKey {
            cluster: 3,
            sub_cluster: 1,
        };
        assert_eq!(key.to_string(), "3.1");
    }
}
