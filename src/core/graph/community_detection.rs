use rand::prelude::*;

use crate::core::graph::graph_structures::*;

/////////////
// Helpers //
/////////////

/// Relabel communities to `0..n` in order of first appearance
///
/// ### Returns
///
/// Tuple of `(relabelled communities, number of communities)`
fn renumber(communities: &[usize]) -> (Vec<usize>, usize) {
    let mut comm_map = vec![usize::MAX; communities.len()];
    let mut label = 0;
    let res = communities
        .iter()
        .map(|&c| {
            if comm_map[c] == usize::MAX {
                comm_map[c] = label;
                label += 1;
            }
            comm_map[c]
        })
        .collect();
    (res, label)
}

/// Local moving phase of the Louvain algorithm
///
/// Every node is taken out of its community and re-inserted into the
/// neighbouring community with the largest modularity gain (staying put if
/// nothing beats the current one).
///
/// ### Params
///
/// * `graph` - The (possibly aggregated) graph.
/// * `resolution` - Resolution parameter.
/// * `m` - Total edge weight of the original graph.
/// * `max_iter` - Maximum sweeps over all nodes.
/// * `rng` - Random number generator for the node order.
///
/// ### Returns
///
/// Tuple of `(community per node, did any node move)`
fn local_moving(
    graph: &SparseGraph,
    resolution: f32,
    m: f32,
    max_iter: usize,
    rng: &mut StdRng,
) -> (Vec<usize>, bool) {
    let n = graph.get_node_number();
    let res_over_two_m = resolution / (2.0 * m);

    let degrees: Vec<f32> = (0..n).map(|i| graph.get_weighted_degree(i)).collect();

    let mut communities: Vec<usize> = (0..n).collect();
    let mut comm_degree_sums = degrees.clone();
    let mut neighbour_weights = vec![0.0f32; n];
    let mut comm_active = vec![false; n];
    let mut active_comms = Vec::with_capacity(256);
    let mut node_order: Vec<usize> = (0..n).collect();
    let mut any_move = false;

    for _ in 0..max_iter {
        let mut move_count = 0;
        node_order.shuffle(rng);

        for &node in &node_order {
            let current_comm = communities[node];
            let k_i = degrees[node];
            let k_i_scaled = k_i * res_over_two_m;

            let (neighbours, weights) = graph.get_neighbours(node);

            for (&neighbour, &weight) in neighbours.iter().zip(weights.iter()) {
                if neighbour == node {
                    continue;
                }
                let comm = communities[neighbour];
                if !comm_active[comm] {
                    comm_active[comm] = true;
                    active_comms.push(comm);
                }
                neighbour_weights[comm] += weight;
            }

            // take the node out of its community
            comm_degree_sums[current_comm] -= k_i;

            let mut best_comm = current_comm;
            let mut best_gain =
                neighbour_weights[current_comm] - k_i_scaled * comm_degree_sums[current_comm];

            for &comm in &active_comms {
                if comm != current_comm {
                    let gain = neighbour_weights[comm] - k_i_scaled * comm_degree_sums[comm];
                    if gain > best_gain + 1e-7 {
                        best_gain = gain;
                        best_comm = comm;
                    }
                }
            }

            for &comm in &active_comms {
                neighbour_weights[comm] = 0.0;
                comm_active[comm] = false;
            }
            active_comms.clear();

            comm_degree_sums[best_comm] += k_i;
            if best_comm != current_comm {
                communities[node] = best_comm;
                move_count += 1;
            }
        }

        if move_count == 0 {
            break;
        }
        any_move = true;
    }

    (communities, any_move)
}

///////////////////////////
// Louvain - SparseGraph //
///////////////////////////

/// Louvain community detection on a `SparseGraph`
///
/// Alternates the local moving phase with the aggregation of communities
/// into single nodes until no node changes its community.
///
/// ### Params
///
/// * `graph` - The undirected graph.
/// * `resolution` - Resolution parameter for the Louvain clustering.
/// * `max_iter` - Maximum sweeps of the local moving phase per level.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// Community label per node, numbered `0..n_communities` in order of first
/// appearance.
pub fn louvain_sparse_graph(
    graph: &SparseGraph,
    resolution: f32,
    max_iter: usize,
    seed: u64,
) -> Vec<usize> {
    let n = graph.get_node_number();
    if n == 0 {
        return Vec::new();
    }

    let m = graph.total_weight();
    if m <= 0.0 {
        // no edges: every node is its own community
        return (0..n).collect();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut membership: Vec<usize> = (0..n).collect();
    let mut current = graph.clone();

    loop {
        let (communities, moved) = local_moving(&current, resolution, m, max_iter, &mut rng);
        if !moved {
            break;
        }
        let (communities, n_comm) = renumber(&communities);
        for c in membership.iter_mut() {
            *c = communities[*c];
        }
        if n_comm == current.get_node_number() {
            break;
        }
        current = current.contract(&communities, n_comm);
    }

    renumber(&membership).0
}
