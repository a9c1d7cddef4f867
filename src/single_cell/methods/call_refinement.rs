use faer::Mat;
use std::fmt;
use std::time::Instant;

use crate::core::base::pca_svd::run_pca;
use crate::core::data::dataset::{ExpressionDataset, Sample};
use crate::error::{QcError, QcResult};
use crate::single_cell::methods::clustering::{cluster_embedding, ClusterParams};
use crate::single_cell::methods::fast_mnn::{fast_mnn, MnnParams};
use crate::single_cell::methods::outlier_clusters::{
    test_family, FamilyId, FamilyResult, OutlierParams,
};
use crate::single_cell::processing::{expressed_genes, log_normalised_dense};
use crate::utils::general::{group_by_label, select_rows};

///////////
// Enums //
///////////

/// Final doublet call of a cell
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DoubletLabel {
    /// Not called at all
    Singlet,
    /// Member of a doublet-enriched sub-cluster of its own sample
    SampleDoublet,
    /// Member of a pooled cluster enriched in sample doublets
    ClusterDoublet,
}

impl DoubletLabel {
    /// Label as written to the result table
    pub fn as_str(&self) -> &'static str {
        match self {
            DoubletLabel::Singlet => "singlet",
            DoubletLabel::SampleDoublet => "sample_doublet",
            DoubletLabel::ClusterDoublet => "cluster_doublet",
        }
    }

    /// Any kind of doublet
    pub fn is_doublet(&self) -> bool {
        !matches!(self, DoubletLabel::Singlet)
    }
}

impl fmt::Display for DoubletLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/////////////
// Results //
/////////////

/// Result of the cross-sample refinement
///
/// ### Fields
///
/// * `pooled_clusters` - Layer-3 cluster per cell of the dataset.
/// * `doublet_fractions` - `(cluster, fraction of sample doublets)` per
///   pooled cluster.
/// * `test` - Outlier test over the doublet fractions.
/// * `labels` - Final `DoubletLabel` per cell.
#[derive(Clone, Debug)]
pub struct RefinementResult {
    pub pooled_clusters: Vec<usize>,
    pub doublet_fractions: Vec<(usize, f64)>,
    pub test: FamilyResult<usize>,
    pub labels: Vec<DoubletLabel>,
}

///////////////
// Functions //
///////////////

/// Order samples for the sequential batch correction
///
/// Stages follow `stage_order`; within a stage the largest sample comes
/// first, ties are broken by the sample identifier.
///
/// ### Params
///
/// * `samples` - The samples.
/// * `stage_order` - Stage labels in merge order.
///
/// ### Returns
///
/// Positions into `samples` in merge order. Errors if a sample's stage is
/// not part of `stage_order`.
pub fn order_samples_for_correction(
    samples: &[Sample],
    stage_order: &[String],
) -> QcResult<Vec<usize>> {
    let mut keyed = Vec::with_capacity(samples.len());
    for (pos, sample) in samples.iter().enumerate() {
        let rank = stage_order
            .iter()
            .position(|s| *s == sample.stage)
            .ok_or_else(|| QcError::UnorderedStage {
                sample: sample.id.clone(),
                stage: sample.stage.clone(),
                order: stage_order.to_vec(),
            })?;
        keyed.push((rank, std::cmp::Reverse(sample.n_cells()), sample.id.as_str(), pos));
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, _, _, pos)| pos).collect())
}

/// Batch-corrected embedding of all cells
///
/// A shared PCA over all cells on the given genes, followed by fastMNN in
/// the given sample order.
///
/// ### Params
///
/// * `dataset` - The expression data.
/// * `samples` - The samples; together they must cover every cell exactly
///   once.
/// * `order` - Positions into `samples` in merge order.
/// * `genes` - Genes for the PCA. If empty, all expressed genes are used.
/// * `params` - The `MnnParams`.
/// * `seed` - Seed for the randomised parts.
///
/// ### Returns
///
/// The corrected embedding, one row per cell of the dataset.
pub fn pooled_embedding(
    dataset: &ExpressionDataset,
    samples: &[Sample],
    order: &[usize],
    genes: &[usize],
    params: &MnnParams,
    seed: u64,
) -> QcResult<Mat<f32>> {
    let all_cells: Vec<usize> = (0..dataset.n_cells()).collect();
    let genes = if genes.is_empty() {
        expressed_genes(dataset.counts(), &all_cells)
    } else {
        genes.to_vec()
    };

    let log_expr = log_normalised_dense(
        dataset.counts(),
        &all_cells,
        &genes,
        dataset.size_factors(),
    );
    let pca = run_pca(
        log_expr.as_ref(),
        params.n_pcs,
        false,
        params.random_svd,
        seed,
    )?;

    let (batches, indices): (Vec<Mat<f32>>, Vec<Vec<usize>>) = order
        .iter()
        .map(|&pos| {
            let cells = &samples[pos].cells;
            (select_rows(pca.scores.as_ref(), cells), cells.clone())
        })
        .unzip();

    fast_mnn(batches, indices, params, seed)
}

/// Promote members of doublet-enriched pooled clusters
///
/// ### Params
///
/// * `pooled_clusters` - Layer-3 cluster per cell.
/// * `sample_doublet` - Per-sample doublet call per cell.
/// * `params` - The `OutlierParams`.
///
/// ### Returns
///
/// The `RefinementResult`. Sample doublets keep their label; the other
/// members of flagged clusters become cluster doublets.
pub fn promote_cluster_doublets(
    pooled_clusters: Vec<usize>,
    sample_doublet: &[bool],
    params: &OutlierParams,
) -> RefinementResult {
    let members = group_by_label(&pooled_clusters);
    let doublet_fractions: Vec<(usize, f64)> = members
        .iter()
        .map(|(&cluster, cells)| {
            let n_doublets = cells.iter().filter(|&&c| sample_doublet[c]).count();
            (cluster, n_doublets as f64 / cells.len() as f64)
        })
        .collect();

    let test = test_family(FamilyId::AllSamples, &doublet_fractions, params);

    let mut flagged = vec![false; members.keys().max().map(|m| m + 1).unwrap_or(0)];
    for cluster in test.outliers() {
        flagged[cluster] = true;
    }

    let labels = pooled_clusters
        .iter()
        .zip(sample_doublet.iter())
        .map(|(&cluster, &is_sample_doublet)| {
            if is_sample_doublet {
                DoubletLabel::SampleDoublet
            } else if flagged[cluster] {
                DoubletLabel::ClusterDoublet
            } else {
                DoubletLabel::Singlet
            }
        })
        .collect();

    RefinementResult {
        pooled_clusters,
        doublet_fractions,
        test,
        labels,
    }
}

/// Cross-sample refinement of the per-sample doublet calls
///
/// ### Params
///
/// * `dataset` - The expression data.
/// * `samples` - The samples, covering every cell exactly once.
/// * `genes` - Genes for the pooled PCA.
/// * `sample_doublet` - Per-sample doublet call per cell.
/// * `stage_order` - Stage labels in merge order.
/// * `mnn_params` - The `MnnParams`.
/// * `cluster_params` - The `ClusterParams` for the pooled clustering.
/// * `outlier_params` - The `OutlierParams`.
///
/// ### Returns
///
/// The `RefinementResult`
#[allow(clippy::too_many_arguments)]
pub fn refine_calls(
    dataset: &ExpressionDataset,
    samples: &[Sample],
    genes: &[usize],
    sample_doublet: &[bool],
    stage_order: &[String],
    mnn_params: &MnnParams,
    cluster_params: &ClusterParams,
    outlier_params: &OutlierParams,
) -> QcResult<RefinementResult> {
    if sample_doublet.len() != dataset.n_cells() {
        return Err(QcError::DimensionMismatch(format!(
            "{} doublet calls for {} cells",
            sample_doublet.len(),
            dataset.n_cells()
        )));
    }

    let start = Instant::now();

    let order = order_samples_for_correction(samples, stage_order)?;
    log::info!(
        "Batch correction order: {:?}",
        order.iter().map(|&p| samples[p].id.as_str()).collect::<Vec<_>>()
    );

    let embd = pooled_embedding(
        dataset,
        samples,
        &order,
        genes,
        mnn_params,
        cluster_params.seed,
    )?;
    let pooled_clusters = cluster_embedding(embd.as_ref(), cluster_params);

    let res = promote_cluster_doublets(pooled_clusters, sample_doublet, outlier_params);

    log::info!(
        "Pooled clustering: {} clusters, {} flagged as doublet-enriched. Done in {:.2?}",
        res.doublet_fractions.len(),
        res.test.outliers().len(),
        start.elapsed()
    );

    Ok(res)
}
