use std::collections::BTreeMap;

use scqc::single_cell::methods::call_refinement::{promote_cluster_doublets, DoubletLabel};
use scqc::single_cell::methods::clustering::SubClusterKey;
use scqc::single_cell::methods::outlier_clusters::{test_families, FamilyId, OutlierParams};

const SUB_CLUSTER_MEDIANS: [f64; 10] = [0.10, 0.11, 0.09, 0.10, 0.12, 0.08, 0.10, 0.11, 0.09, 2.0];

fn key(cluster: usize) -> SubClusterKey {
    SubClusterKey {
        cluster,
        sub_cluster: 0,
    }
}

/// Pooled clusters of 200 cells (two samples of 100)
///
/// Pooled cluster 9 holds the ten called cells of s1 plus ten uncalled cells
/// of s2; the called cells of s2 are scattered over the other clusters.
fn pooled_clusters() -> Vec<usize> {
    (0..200)
        .map(|i| match i {
            0..=89 => i / 10,
            90..=99 => 9,
            100..=179 => (i - 100) / 10,
            180..=189 => 9,
            _ => (i - 190) % 9,
        })
        .collect()
}

#[test]
fn test_sample_doublets_win_over_cluster_promotion() {
    let params = OutlierParams::default();

    // per-sample stage: ten sub-clusters of ten cells, the last one outlying
    let mut families = BTreeMap::new();
    for sample in ["s1", "s2"] {
        let stats: Vec<(SubClusterKey, f64)> = SUB_CLUSTER_MEDIANS
            .iter()
            .enumerate()
            .map(|(c, &m)| (key(c), m))
            .collect();
        families.insert(FamilyId::Sample(sample.to_string()), stats);
    }
    let results = test_families(families, &params);
    assert_eq!(results.len(), 2);
    for res in &results {
        assert_eq!(res.outliers(), vec![key(9)]);
    }

    // cells 90..100 of s1 and 190..200 of s2 are in sub-cluster 9
    let sample_doublet: Vec<bool> = (0..200).map(|i| i % 100 >= 90).collect();

    let refined = promote_cluster_doublets(pooled_clusters(), &sample_doublet, &params);
    assert_eq!(refined.test.outliers(), vec![9]);
    assert_eq!(refined.doublet_fractions.len(), 10);
    assert_eq!(refined.doublet_fractions[9], (9, 0.5));

    for (i, label) in refined.labels.iter().enumerate() {
        let expected = match i {
            90..=99 | 190..=199 => DoubletLabel::SampleDoublet,
            180..=189 => DoubletLabel::ClusterDoublet,
            _ => DoubletLabel::Singlet,
        };
        assert_eq!(*label, expected, "cell {}", i);
    }
}

#[test]
fn test_single_pooled_cluster_is_not_tested() {
    let sample_doublet: Vec<bool> = (0..30).map(|i| i < 3).collect();
    let refined =
        promote_cluster_doublets(vec![0; 30], &sample_doublet, &OutlierParams::default());
    assert!(!refined.test.is_tested());
    assert!(refined.test.outliers().is_empty());
    assert_eq!(
        refined
            .labels
            .iter()
            .filter(|l| **l == DoubletLabel::ClusterDoublet)
            .count(),
        0
    );
}
