use faer::MatRef;
use instant_distance::{Builder, Point as DistancePoint, Search};
use rayon::prelude::*;
use serde::Deserialize;

use crate::utils::general::{mat_to_rows, squared_euclidean};

///////////
// Enums //
///////////

/// Enum for the different kNN search methods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnnSearch {
    /// Brute force search over all points
    Exact,
    /// Hierarchical Navigable Small World
    Hnsw,
}

/// Helper function to get the KNN method
///
/// ### Params
///
/// * `s` - Type of KNN algorithm to use
///
/// ### Returns
///
/// Option of the KnnSearch
pub fn parse_knn_method(s: &str) -> Option<KnnSearch> {
    match s.to_lowercase().as_str() {
        "exact" => Some(KnnSearch::Exact),
        "hnsw" => Some(KnnSearch::Hnsw),
        _ => None,
    }
}

////////////////
// Structures //
////////////////

#[derive(Clone, Debug)]
struct Point(Vec<f32>);

impl DistancePoint for Point {
    /// Distance function. This is Euclidean distance without squaring for
    /// speed gains. Does not change the rank order in KNN generation.
    fn distance(&self, other: &Self) -> f32 {
        squared_euclidean(&self.0, &other.0)
    }
}

////////////////////
// Main functions //
////////////////////

/// Exact kNN search
///
/// ### Params
///
/// * `query` - Query points (rows).
/// * `reference` - Reference points (rows), same number of columns.
/// * `k` - Number of neighbours.
/// * `exclude_self` - Query and reference are the same set; a point is not
///   reported as its own neighbour.
///
/// ### Returns
///
/// For every query point, the indices of its nearest reference points,
/// sorted by increasing distance (ties broken by index).
pub fn generate_knn_exact(
    query: MatRef<f32>,
    reference: MatRef<f32>,
    k: usize,
    exclude_self: bool,
) -> Vec<Vec<usize>> {
    let query_rows = mat_to_rows(query);
    let ref_rows = mat_to_rows(reference);

    query_rows
        .par_iter()
        .enumerate()
        .map(|(i, q)| {
            let mut dists: Vec<(f32, usize)> = ref_rows
                .iter()
                .enumerate()
                .filter(|(j, _)| !(exclude_self && *j == i))
                .map(|(j, r)| (squared_euclidean(q, r), j))
                .collect();
            let k_eff = k.min(dists.len());
            if k_eff == 0 {
                return Vec::new();
            }
            let cmp = |a: &(f32, usize), b: &(f32, usize)| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            };
            if k_eff < dists.len() {
                dists.select_nth_unstable_by(k_eff - 1, cmp);
                dists.truncate(k_eff);
            }
            dists.sort_unstable_by(cmp);
            dists.into_iter().map(|(_, j)| j).collect()
        })
        .collect()
}

/// Get the kNN graph based on HNSW
///
/// This function generates the kNN via an approximate nearest neighbour
/// search based on the HNSW algorithm (hierarchical navigable small world).
///
/// ### Params
///
/// * `query` - Query points (rows).
/// * `reference` - Reference points (rows) that are indexed.
/// * `k` - Number of neighbours.
/// * `exclude_self` - Query and reference are the same set.
/// * `seed` - Seed for the HNSW algorithm
///
/// ### Returns
///
/// The k-nearest neighbours based on the HNSW algorithm
pub fn generate_knn_hnsw(
    query: MatRef<f32>,
    reference: MatRef<f32>,
    k: usize,
    exclude_self: bool,
    seed: u64,
) -> Vec<Vec<usize>> {
    let n_ref = reference.nrows();
    let ref_points: Vec<Point> = mat_to_rows(reference).into_iter().map(Point).collect();
    let query_points: Vec<Point> = mat_to_rows(query).into_iter().map(Point).collect();

    let map = Builder::default()
        .seed(seed)
        .build(ref_points, (0..n_ref).collect::<Vec<_>>());

    let take = if exclude_self { k + 1 } else { k };

    query_points
        .par_iter()
        .enumerate()
        .map(|(i, point)| {
            let mut search = Search::default();
            let mut nearest_neighbours: Vec<usize> = map
                .search(point, &mut search)
                .take(take)
                .map(|item| *item.value)
                .collect();

            if exclude_self {
                nearest_neighbours.retain(|&x| x != i);
            }
            nearest_neighbours.truncate(k);
            nearest_neighbours
        })
        .collect()
}

/// Dispatch the kNN search
///
/// ### Params
///
/// * `query` - Query points (rows).
/// * `reference` - Reference points (rows).
/// * `k` - Number of neighbours.
/// * `method` - Which `KnnSearch` to use.
/// * `exclude_self` - Query and reference are the same set.
/// * `seed` - Seed for the approximate search.
///
/// ### Returns
///
/// The neighbour indices per query point.
pub fn find_knn(
    query: MatRef<f32>,
    reference: MatRef<f32>,
    k: usize,
    method: KnnSearch,
    exclude_self: bool,
    seed: u64,
) -> Vec<Vec<usize>> {
    match method {
        KnnSearch::Exact => generate_knn_exact(query, reference, k, exclude_self),
        KnnSearch::Hnsw => generate_knn_hnsw(query, reference, k, exclude_self, seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn line_points() -> Mat<f32> {
        // points on a line at 0, 1, 2, 10, 11
        let xs = [0.0, 1.0, 2.0, 10.0, 11.0];
        Mat::from_fn(5, 2, |i, j| if j == 0 { xs[i] } else { 0.0 })
    }

    #[test]
    fn test_exact_knn_self() {
        let pts = line_points();
        let knn = generate_knn_exact(pts.as_ref(), pts.as_ref(), 2, true);
        assert_eq!(knn[0], vec![1, 2]);
        assert_eq!(knn[3], vec![4, 2]);
        assert!(knn.iter().enumerate().all(|(i, n)| !n.contains(&i)));
    }

    #[test]
    fn test_exact_knn_cross() {
        let pts = line_points();
        let query = Mat::from_fn(1, 2, |_, j| if j == 0 { 9.0 } else { 0.0 });
        let knn = generate_knn_exact(query.as_ref(), pts.as_ref(), 10, false);
        assert_eq!(knn[0], vec![3, 4, 2, 1, 0]);
    }

    #[test]
    fn test_hnsw_matches_exact_on_small_data() {
        let pts = line_points();
        let knn = generate_knn_hnsw(pts.as_ref(), pts.as_ref(), 1, true, 42);
        assert_eq!(knn[0], vec![1]);
        assert_eq!(knn[4], vec![3]);
    }

    #[test]
    fn test_parse_knn_method() {
        assert_eq!(parse_knn_method("HNSW"), Some(KnnSearch::Hnsw));
        assert_eq!(parse_knn_method("annoy"), None);
    }
}
