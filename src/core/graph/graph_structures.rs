use rustc_hash::FxHashMap;

use crate::core::data::sparse_structures::*;

/////////////////////////////
// Sparse graph structures //
/////////////////////////////

/// Structure representation of an undirected, weighted sparse graph
///
/// ### Fields
///
/// * `adjacency` - Sparse CSR representation of the graph. Symmetric, self
///   loops are stored once on the diagonal.
/// * `num_nodes` - Number of nodes represented in the graph.
#[derive(Clone, Debug)]
pub struct SparseGraph {
    adjacency: CompressedSparseData<f32>,
    num_nodes: usize,
}

impl SparseGraph {
    /// Generate the graph from an edge list
    ///
    /// Edges are undirected; duplicated edges between the same two nodes are
    /// summed up. A self loop `(i, i, w)` adds `w` to the diagonal.
    ///
    /// ### Params
    ///
    /// * `num_nodes` - Number of nodes.
    /// * `edges` - Slice of `(from, to, weight)`.
    ///
    /// ### Returns
    ///
    /// The initialised graph.
    pub fn from_edges(num_nodes: usize, edges: &[(usize, usize, f32)]) -> Self {
        let mut merged: FxHashMap<(usize, usize), f32> = FxHashMap::default();
        for &(a, b, w) in edges {
            let key = if a <= b { (a, b) } else { (b, a) };
            *merged.entry(key).or_insert(0.0) += w;
        }

        let mut rows: Vec<Vec<(usize, f32)>> = vec![Vec::new(); num_nodes];
        for ((a, b), w) in merged {
            rows[a].push((b, w));
            if a != b {
                rows[b].push((a, w));
            }
        }

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(num_nodes + 1);
        indptr.push(0);
        for row in rows.iter_mut() {
            row.sort_unstable_by_key(|(j, _)| *j);
            for &(j, w) in row.iter() {
                indices.push(j);
                data.push(w);
            }
            indptr.push(indices.len());
        }

        Self {
            adjacency: CompressedSparseData {
                data,
                indices,
                indptr,
                cs_type: CompressedSparseFormat::Csr,
                shape: (num_nodes, num_nodes),
            },
            num_nodes,
        }
    }

    /// Helper function to get the neighbours and weights
    ///
    /// ### Params
    ///
    /// * `node` - Index of the node for which to get the neighbours
    ///
    /// ### Return
    ///
    /// Tuple of `(neighbour_indices, edge_weights)`
    #[inline]
    pub fn get_neighbours(&self, node: usize) -> (&[usize], &[f32]) {
        self.adjacency.row(node)
    }

    /// Weighted degree of a node (self loops counted twice)
    #[inline]
    pub fn get_weighted_degree(&self, node: usize) -> f32 {
        let (neighbours, weights) = self.get_neighbours(node);
        neighbours
            .iter()
            .zip(weights.iter())
            .map(|(&j, &w)| if j == node { 2.0 * w } else { w })
            .sum()
    }

    /// Get total weight
    ///
    /// ### Returns
    ///
    /// The total edge weight (each undirected edge counted once)
    pub fn total_weight(&self) -> f32 {
        (0..self.num_nodes)
            .map(|i| self.get_weighted_degree(i))
            .sum::<f32>()
            * 0.5
    }

    /// Expose the number of nodes
    pub fn get_node_number(&self) -> usize {
        self.num_nodes
    }

    /// Contract the graph along a node partition
    ///
    /// ### Params
    ///
    /// * `membership` - Coarse node per node; labels must be `0..n_coarse`.
    /// * `n_coarse` - Number of coarse nodes.
    ///
    /// ### Returns
    ///
    /// The coarse graph. Edges within a coarse node become a self loop.
    pub fn contract(&self, membership: &[usize], n_coarse: usize) -> SparseGraph {
        let mut edges = Vec::with_capacity(self.adjacency.get_nnz());
        for i in 0..self.num_nodes {
            let (neighbours, weights) = self.get_neighbours(i);
            for (&j, &w) in neighbours.iter().zip(weights.iter()) {
                // every off-diagonal edge is visited from both ends
                if j > i {
                    edges.push((membership[i], membership[j], w));
                } else if j == i {
                    edges.push((membership[i], membership[i], w));
                }
            }
        }
        SparseGraph::from_edges(n_coarse, &edges)
    }
}
