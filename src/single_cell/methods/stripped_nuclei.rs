use serde::Deserialize;

use crate::core::base::stats::median;
use crate::single_cell::processing::CellQuality;
use crate::utils::general::group_by_label;

////////////
// Params //
////////////

/// Parameters of the stripped nucleus classification
///
/// ### Fields
///
/// * `mito_threshold` - Clusters with a median mitochondrial fraction
///   strictly below this value are stripped nuclei.
/// * `mito_chromosome` - Chromosome name of the mitochondrial genes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StrippedParams {
    pub mito_threshold: f64,
    pub mito_chromosome: String,
}

impl Default for StrippedParams {
    fn default() -> Self {
        Self {
            mito_threshold: 0.005,
            mito_chromosome: "MT".to_string(),
        }
    }
}

/////////////
// Results //
/////////////

/// Summary of one pooled cluster
///
/// ### Fields
///
/// * `cluster` - The pooled cluster.
/// * `n_cells` - Number of cells.
/// * `median_mito_fraction` - Median over the cells with a defined
///   mitochondrial fraction; `None` if no cell has one.
/// * `median_lib_size` - Median library size.
/// * `stripped` - The cluster is flagged.
#[derive(Clone, Debug)]
pub struct ClusterNucleusStats {
    pub cluster: usize,
    pub n_cells: usize,
    pub median_mito_fraction: Option<f64>,
    pub median_lib_size: f64,
    pub stripped: bool,
}

/// Stripped nucleus calls
///
/// ### Fields
///
/// * `clusters` - Per pooled cluster summary, sorted by cluster.
/// * `stripped` - Flag per cell.
#[derive(Clone, Debug)]
pub struct StrippedResult {
    pub clusters: Vec<ClusterNucleusStats>,
    pub stripped: Vec<bool>,
}

impl StrippedResult {
    /// Number of flagged clusters
    pub fn n_stripped_clusters(&self) -> usize {
        self.clusters.iter().filter(|c| c.stripped).count()
    }

    /// Number of flagged cells
    pub fn n_stripped_cells(&self) -> usize {
        self.stripped.iter().filter(|&&s| s).count()
    }
}

///////////////
// Functions //
///////////////

/// Flag pooled clusters with a low mitochondrial fraction
///
/// ### Params
///
/// * `pooled_clusters` - Layer-3 cluster per cell.
/// * `quality` - The `CellQuality` of the same cells.
/// * `params` - The `StrippedParams`.
///
/// ### Returns
///
/// The `StrippedResult`
pub fn classify_stripped(
    pooled_clusters: &[usize],
    quality: &CellQuality,
    params: &StrippedParams,
) -> StrippedResult {
    let members = group_by_label(pooled_clusters);

    let clusters: Vec<ClusterNucleusStats> = members
        .iter()
        .map(|(&cluster, cells)| {
            let mito: Vec<f64> = cells
                .iter()
                .filter_map(|&c| quality.mito_fraction[c])
                .collect();
            let lib: Vec<f64> = cells.iter().map(|&c| quality.lib_size[c] as f64).collect();
            let median_mito_fraction = median(&mito);
            let stripped = median_mito_fraction
                .map(|m| m < params.mito_threshold)
                .unwrap_or(false);
            ClusterNucleusStats {
                cluster,
                n_cells: cells.len(),
                median_mito_fraction,
                median_lib_size: median(&lib).unwrap_or(0.0),
                stripped,
            }
        })
        .collect();

    let mut flagged = vec![false; members.keys().max().map(|m| m + 1).unwrap_or(0)];
    for stats in clusters.iter().filter(|s| s.stripped) {
        flagged[stats.cluster] = true;
    }
    let stripped = pooled_clusters.iter().map(|&c| flagged[c]).collect();

    for stats in clusters.iter().filter(|s| s.stripped) {
        log::info!(
            "Pooled cluster {} ({} cells) flagged as stripped nuclei: median mito fraction {:.4}, median library size {:.0}",
            stats.cluster,
            stats.n_cells,
            stats.median_mito_fraction.unwrap_or(f64::NAN),
            stats.median_lib_size
        );
    }

    StrippedResult { clusters, stripped }
}
