use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::base::stats::{calc_fdr, normal_upper_pval, upper_tail_location_spread};

////////////
// Params //
////////////

/// Parameters of the outlier cluster test
///
/// ### Fields
///
/// * `fdr_threshold` - Clusters with a q-value below this are flagged.
/// * `min_clusters` - Families with fewer clusters are not tested.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OutlierParams {
    pub fdr_threshold: f64,
    pub min_clusters: usize,
}

impl Default for OutlierParams {
    fn default() -> Self {
        Self {
            fdr_threshold: 0.1,
            min_clusters: 2,
        }
    }
}

////////////////
// Structures //
////////////////

/// Identifier of a family of simultaneously tested clusters
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FamilyId {
    /// The sub-clusters of one sample
    Sample(String),
    /// The pooled clusters over all samples
    AllSamples,
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyId::Sample(s) => write!(f, "sample '{}'", s),
            FamilyId::AllSamples => write!(f, "all samples"),
        }
    }
}

/// Test result of one cluster
///
/// ### Fields
///
/// * `key` - The cluster key.
/// * `statistic` - The tested summary statistic.
/// * `p_value` - One-sided upper tail p-value.
/// * `q_value` - BH-adjusted p-value within the family.
/// * `outlier` - `q_value < fdr_threshold`.
#[derive(Clone, Debug)]
pub struct ClusterTest<K> {
    pub key: K,
    pub statistic: f64,
    pub p_value: f64,
    pub q_value: f64,
    pub outlier: bool,
}

/// Outcome of testing one family
#[derive(Clone, Debug)]
pub enum FamilyOutcome<K> {
    /// Null fitted, all clusters tested
    Tested {
        location: f64,
        spread: f64,
        clusters: Vec<ClusterTest<K>>,
    },
    /// Too few clusters to estimate the null; nothing flagged
    InsufficientClusters { n_clusters: usize },
}

/// Result of one family
///
/// ### Fields
///
/// * `family` - The `FamilyId`.
/// * `outcome` - The `FamilyOutcome`.
#[derive(Clone, Debug)]
pub struct FamilyResult<K> {
    pub family: FamilyId,
    pub outcome: FamilyOutcome<K>,
}

impl<K: Clone> FamilyResult<K> {
    /// Keys of the flagged clusters
    pub fn outliers(&self) -> Vec<K> {
        match &self.outcome {
            FamilyOutcome::Tested { clusters, .. } => clusters
                .iter()
                .filter(|c| c.outlier)
                .map(|c| c.key.clone())
                .collect(),
            FamilyOutcome::InsufficientClusters { .. } => Vec::new(),
        }
    }

    /// Whether the family was tested at all
    pub fn is_tested(&self) -> bool {
        matches!(self.outcome, FamilyOutcome::Tested { .. })
    }
}

///////////////
// Functions //
///////////////

/// Test one family of clusters for upper-tail outliers
///
/// The null is a normal distribution centred on the family median with the
/// spread estimated from the values above the median only. P-values are
/// BH-corrected within the family.
///
/// ### Params
///
/// * `family` - The `FamilyId`.
/// * `statistics` - Pairs of `(cluster key, statistic)`. Non-finite
///   statistics are dropped before testing.
/// * `params` - The `OutlierParams`.
///
/// ### Returns
///
/// The `FamilyResult`
pub fn test_family<K: Clone>(
    family: FamilyId,
    statistics: &[(K, f64)],
    params: &OutlierParams,
) -> FamilyResult<K> {
    let finite: Vec<(K, f64)> = statistics
        .iter()
        .filter(|(_, v)| v.is_finite())
        .cloned()
        .collect();

    if finite.len() < params.min_clusters.max(2) {
        log::warn!(
            "Insufficient clusters for outlier testing in {}: {} cluster(s)",
            family,
            finite.len()
        );
        return FamilyResult {
            family,
            outcome: FamilyOutcome::InsufficientClusters {
                n_clusters: finite.len(),
            },
        };
    }

    let values: Vec<f64> = finite.iter().map(|(_, v)| *v).collect();
    // non-empty by the check above
    let (location, spread) = upper_tail_location_spread(&values).unwrap_or((0.0, 0.0));

    let p_values: Vec<f64> = values
        .iter()
        .map(|&v| normal_upper_pval(v, location, spread))
        .collect();
    let q_values = calc_fdr(&p_values);

    let clusters = finite
        .into_iter()
        .zip(p_values)
        .zip(q_values)
        .map(|(((key, statistic), p_value), q_value)| ClusterTest {
            key,
            statistic,
            p_value,
            q_value,
            outlier: q_value < params.fdr_threshold,
        })
        .collect();

    FamilyResult {
        family,
        outcome: FamilyOutcome::Tested {
            location,
            spread,
            clusters,
        },
    }
}

/// Test several independent families
///
/// ### Params
///
/// * `families` - Map of family to its `(cluster key, statistic)` pairs.
/// * `params` - The `OutlierParams`.
///
/// ### Returns
///
/// One `FamilyResult` per family, in the order of the map.
pub fn test_families<K: Clone>(
    families: BTreeMap<FamilyId, Vec<(K, f64)>>,
    params: &OutlierParams,
) -> Vec<FamilyResult<K>> {
    families
        .into_iter()
        .map(|(family, stats)| test_family(family, &stats, params))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(values: &[f64]) -> Vec<(usize, f64)> {
        values.iter().copied().enumerate().collect()
    }

    #[test]
    fn test_constant_family_has_no_outliers() {
        let res = test_family(FamilyId::AllSamples, &keyed(&[0.3; 12]), &Default::default());
        assert!(res.is_tested());
        assert!(res.outliers().is_empty());
        if let FamilyOutcome::Tested { spread, .. } = res.outcome {
            assert_eq!(spread, 0.0);
        }
    }

    #[test]
    fn test_single_extreme_is_flagged() {
        let mut values: Vec<f64> = (0..11).map(|i| 0.10 + 0.002 * i as f64).collect();
        values.push(1.5);
        let res = test_family(
            FamilyId::Sample("s1".to_string()),
            &keyed(&values),
            &Default::default(),
        );
        assert_eq!(res.outliers(), vec![11]);
    }

    #[test]
    fn test_q_values_monotone_in_p() {
        let values = [0.1, 0.5, 0.12, 0.9, 0.11, 0.3, 0.13, 0.14, 0.1, 0.2];
        let res = test_family(FamilyId::AllSamples, &keyed(&values), &Default::default());
        let FamilyOutcome::Tested { clusters, .. } = res.outcome else {
            panic!("family should be tested");
        };
        let mut pairs: Vec<(f64, f64)> = clusters.iter().map(|c| (c.p_value, c.q_value)).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for w in pairs.windows(2) {
            assert!(w[0].1 <= w[1].1 + 1e-12);
        }
    }

    #[test]
    fn test_single_cluster_is_insufficient() {
        let res = test_family(FamilyId::AllSamples, &keyed(&[4.0]), &Default::default());
        assert!(matches!(
            res.outcome,
            FamilyOutcome::InsufficientClusters { n_clusters: 1 }
        ));
        assert!(res.outliers().is_empty());
    }

    #[test]
    fn test_families_are_corrected_separately() {
        let mut families = BTreeMap::new();
        let mut tight: Vec<f64> = (0..11).map(|i| 1.0 + 0.01 * i as f64).collect();
        tight.push(3.0);
        families.insert(FamilyId::Sample("a".to_string()), keyed(&tight));
        families.insert(FamilyId::Sample("b".to_string()), keyed(&[1.0]));
        let res = test_families(families, &Default::default());
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].outliers(), vec![11]);
        assert!(!res[1].is_tested());
    }
}
