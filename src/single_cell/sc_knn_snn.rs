use faer::MatRef;
use rayon::prelude::*;
use serde::Deserialize;

use crate::core::graph::graph_structures::SparseGraph;
use crate::core::graph::knn::{find_knn, KnnSearch};

///////////
// Enums //
///////////

/// SNN similarity method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnnSimilarityMethod {
    /// This will calculate the Jaccard similarity as weight
    Jaccard,
    /// This will calculate the Rank version as a weight
    Rank,
}

////////////////////
// Main functions //
////////////////////

/// Generate an sNN graph based on the kNN graph
///
/// This version will compare all cells against all cells and generate an edge
/// if any neighbours are shared (a cell counts as its own neighbour of rank
/// zero). This is the approach taken in the `bluster` R package.
///
/// With `Rank`, the weight of an edge is `k - r / 2` with `r` the smallest
/// sum of the ranks of a shared neighbour, scaled by `k`. With `Jaccard`, it
/// is the Jaccard index of the two neighbourhoods.
///
/// ### Params
///
/// * `knn` - K-nearest neighbours per cell, self excluded, sorted by
///   distance.
/// * `k` - Number of neighbours in the kNN graph
/// * `method` - Which similarity method to use
///
/// ### Returns
///
/// Vector of `(cell_i, cell_j, weight)` with `cell_j < cell_i`.
pub fn generate_snn(
    knn: &[Vec<usize>],
    k: usize,
    method: SnnSimilarityMethod,
) -> Vec<(usize, usize, f32)> {
    let n_samples = knn.len();
    let mut reverse_mappings: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n_samples];

    for (i, neighbours) in knn.iter().enumerate() {
        reverse_mappings[i].push((i, 0));
        for (rank, &neighbour) in neighbours.iter().enumerate() {
            reverse_mappings[neighbour].push((i, rank + 1));
        }
    }

    (0..n_samples)
        .into_par_iter()
        .flat_map(|j| {
            let mut scores = vec![0.0f32; n_samples];
            let mut added = Vec::new();

            let own = std::iter::once(j).chain(knn[j].iter().copied());
            for (i, cur_neighbour) in own.enumerate() {
                for &(othernode, other_rank) in &reverse_mappings[cur_neighbour] {
                    if othernode < j {
                        match method {
                            SnnSimilarityMethod::Rank => {
                                let combined_rank = (i + other_rank) as f32;
                                if scores[othernode] == 0.0 {
                                    scores[othernode] = combined_rank;
                                    added.push(othernode);
                                } else if combined_rank < scores[othernode] {
                                    scores[othernode] = combined_rank;
                                }
                            }
                            SnnSimilarityMethod::Jaccard => {
                                if scores[othernode] == 0.0 {
                                    added.push(othernode);
                                }
                                scores[othernode] += 1.0;
                            }
                        }
                    }
                }
            }

            added
                .into_iter()
                .map(|othernode| {
                    let weight = match method {
                        SnnSimilarityMethod::Rank => {
                            let preliminary = k as f32 - scores[othernode] / 2.0;
                            preliminary.max(1e-6) / k as f32
                        }
                        SnnSimilarityMethod::Jaccard => {
                            scores[othernode] / (2.0 * (k as f32 + 1.0) - scores[othernode])
                        }
                    };
                    (j, othernode, weight)
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Build the SNN graph of an embedding
///
/// ### Params
///
/// * `embd` - Cells x dimensions.
/// * `k` - Number of neighbours; capped at `n_cells - 1`.
/// * `method` - SNN weighting.
/// * `knn_method` - kNN search method.
/// * `seed` - Seed for approximate kNN search.
///
/// ### Returns
///
/// The undirected `SparseGraph` over the cells.
pub fn build_snn_graph(
    embd: MatRef<f32>,
    k: usize,
    method: SnnSimilarityMethod,
    knn_method: KnnSearch,
    seed: u64,
) -> SparseGraph {
    let n = embd.nrows();
    let k = k.min(n.saturating_sub(1));
    if k == 0 {
        return SparseGraph::from_edges(n, &[]);
    }
    let knn = find_knn(embd, embd, k, knn_method, true, seed);
    let edges = generate_snn(&knn, k, method);
    SparseGraph::from_edges(n, &edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_weights() {
        // 0 <-> 1 mutual first neighbours, 2 points to 1
        let knn = vec![vec![1], vec![0], vec![1]];
        let edges = generate_snn(&knn, 1, SnnSimilarityMethod::Rank);

        let weight = |a: usize, b: usize| {
            edges
                .iter()
                .find(|(i, j, _)| (*i == a && *j == b) || (*i == b && *j == a))
                .map(|(_, _, w)| *w)
        };
        // 0 and 1: shared neighbour 1 with ranks 1 (for 0) and 0 (for 1)
        assert!((weight(0, 1).unwrap() - 0.5).abs() < 1e-6);
        // 2 and 1: shared neighbour 1 with ranks 1 and 0
        assert!((weight(1, 2).unwrap() - 0.5).abs() < 1e-6);
        // 0 and 2 share neighbour 1 at rank 1 each -> k - 1 = 0 -> floored
        assert!(weight(0, 2).unwrap() < 1e-5);
    }

    #[test]
    fn test_jaccard_weights() {
        let knn = vec![vec![1], vec![0], vec![1]];
        let edges = generate_snn(&knn, 1, SnnSimilarityMethod::Jaccard);
        // 0: {0, 1}, 1: {1, 0} -> two shared -> 2 / (4 - 2) = 1
        let w01 = edges
            .iter()
            .find(|(i, j, _)| *i == 1 && *j == 0)
            .map(|(_, _, w)| *w)
            .unwrap();
        assert!((w01 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_edges_are_unique() {
        let knn = vec![vec![1, 2], vec![0, 2], vec![1, 0], vec![2, 1]];
        let edges = generate_snn(&knn, 2, SnnSimilarityMethod::Rank);
        let mut pairs: Vec<(usize, usize)> = edges.iter().map(|(i, j, _)| (*i, *j)).collect();
        let n = pairs.len();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), n);
        assert!(edges.iter().all(|(i, j, _)| j < i));
    }
}
