use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use crate::core::base::stats::median;
use crate::core::data::dataset::{ExpressionDataset, GeneAnnotation, Sample};
use crate::error::{QcError, QcResult};
use crate::single_cell::methods::call_refinement::{refine_calls, DoubletLabel, RefinementResult};
use crate::single_cell::methods::clustering::{
    cluster_sample, ClusterParams, SampleClustering, SubClusterKey,
};
use crate::single_cell::methods::doublet_detection::{DoubletParams, DoubletScorer, DoubletScores};
use crate::single_cell::methods::fast_mnn::MnnParams;
use crate::single_cell::methods::outlier_clusters::{
    test_family, FamilyId, FamilyResult, OutlierParams,
};
use crate::single_cell::methods::stripped_nuclei::{
    classify_stripped, StrippedParams, StrippedResult,
};
use crate::single_cell::processing::CellQuality;
use crate::single_cell::validation::ValidationParams;
use crate::utils::general::group_by_label;

////////////
// Params //
////////////

/// Default merge order of the developmental stages, oldest first
pub fn default_stage_order() -> Vec<String> {
    [
        "E8.5",
        "E8.25",
        "E8.0",
        "E7.75",
        "E7.5",
        "E7.25",
        "mixed_gastrulation",
        "E7.0",
        "E6.75",
        "E6.5",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// All parameters of the QC pipeline
///
/// Deserialises from JSON; missing keys keep their defaults.
///
/// ### Fields
///
/// * `doublet` - The `DoubletParams` of the per-sample scoring.
/// * `cluster` - The `ClusterParams`, shared by all clustering layers.
/// * `outlier` - The `OutlierParams`, shared by both test families.
/// * `mnn` - The `MnnParams` of the batch correction.
/// * `stripped` - The `StrippedParams`.
/// * `validation` - The `ValidationParams` of the report.
/// * `stage_order` - Stage labels in batch correction order.
/// * `n_threads` - Size of the worker pool; all cores if `None`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QcParams {
    pub doublet: DoubletParams,
    pub cluster: ClusterParams,
    pub outlier: OutlierParams,
    pub mnn: MnnParams,
    pub stripped: StrippedParams,
    pub validation: ValidationParams,
    pub stage_order: Vec<String>,
    pub n_threads: Option<usize>,
}

impl Default for QcParams {
    fn default() -> Self {
        Self {
            doublet: DoubletParams::default(),
            cluster: ClusterParams::default(),
            outlier: OutlierParams::default(),
            mnn: MnnParams::default(),
            stripped: StrippedParams::default(),
            validation: ValidationParams::default(),
            stage_order: default_stage_order(),
            n_threads: None,
        }
    }
}

impl QcParams {
    /// Read the parameters from a JSON file
    ///
    /// ### Params
    ///
    /// * `path` - Path to the JSON file.
    ///
    /// ### Returns
    ///
    /// The `QcParams` with the keys of the file overriding the defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> QcResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/////////////
// Results //
/////////////

/// Result of the per-sample stage
///
/// ### Fields
///
/// * `sample` - The sample identifier.
/// * `cells` - Dataset indices of the cells; all per-cell vectors follow
///   this order.
/// * `scores` - The `DoubletScores`.
/// * `clustering` - Layer-1 and Layer-2 clusters.
/// * `test` - Outlier test over the median scores of the sub-clusters.
/// * `sample_doublet` - Per-sample doublet call per cell.
#[derive(Clone, Debug)]
pub struct SampleResult {
    pub sample: String,
    pub cells: Vec<usize>,
    pub scores: DoubletScores,
    pub clustering: SampleClustering,
    pub test: FamilyResult<SubClusterKey>,
    pub sample_doublet: Vec<bool>,
}

/// Final QC record of one cell
#[derive(Clone, Debug)]
pub struct CellQc {
    pub barcode: String,
    pub sample: String,
    pub stage: String,
    pub doublet_score: Option<f64>,
    pub sample_cluster: usize,
    pub sub_cluster: SubClusterKey,
    pub pooled_cluster: usize,
    pub doublet_label: DoubletLabel,
    pub mito_fraction: Option<f64>,
    pub lib_size: u64,
    pub stripped: bool,
}

/// Results of the QC pipeline
///
/// ### Fields
///
/// * `samples` - Per-sample results, sorted by sample identifier.
/// * `refinement` - The cross-sample `RefinementResult`.
/// * `stripped` - The `StrippedResult`.
/// * `cells` - One `CellQc` per cell of the dataset, in dataset order.
#[derive(Clone, Debug)]
pub struct QcResults {
    pub samples: Vec<SampleResult>,
    pub refinement: RefinementResult,
    pub stripped: StrippedResult,
    pub cells: Vec<CellQc>,
}

fn fmt_optional(x: Option<f64>) -> String {
    match x {
        Some(v) => format!("{:.6}", v),
        None => "NA".to_string(),
    }
}

/// One row of the output table; field order is column order
#[derive(Serialize)]
struct TableRow<'a> {
    barcode: &'a str,
    sample: &'a str,
    stage: &'a str,
    doublet_score: String,
    sample_cluster: usize,
    sub_cluster: String,
    pooled_cluster: usize,
    doublet_label: &'static str,
    mito_fraction: String,
    stripped: bool,
}

impl<'a> From<&'a CellQc> for TableRow<'a> {
    fn from(cell: &'a CellQc) -> Self {
        Self {
            barcode: &cell.barcode,
            sample: &cell.sample,
            stage: &cell.stage,
            doublet_score: fmt_optional(cell.doublet_score),
            sample_cluster: cell.sample_cluster,
            sub_cluster: cell.sub_cluster.to_string(),
            pooled_cluster: cell.pooled_cluster,
            doublet_label: cell.doublet_label.as_str(),
            mito_fraction: fmt_optional(cell.mito_fraction),
            stripped: cell.stripped,
        }
    }
}

impl QcResults {
    /// Final labels per cell
    pub fn labels(&self) -> Vec<DoubletLabel> {
        self.cells.iter().map(|c| c.doublet_label).collect()
    }

    /// Write one row per cell as TSV
    ///
    /// ### Params
    ///
    /// * `path` - Output file.
    pub fn write_tsv<P: AsRef<Path>>(&self, path: P) -> QcResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(File::create(path)?);
        for cell in &self.cells {
            writer.serialize(TableRow::from(cell))?;
        }
        writer.flush()?;
        Ok(())
    }
}

///////////////
// Functions //
///////////////

/// Median doublet score per sub-cluster
///
/// Sub-clusters without any defined score are left out.
///
/// ### Params
///
/// * `sub_clusters` - Sub-cluster key per cell.
/// * `scores` - Doublet score per cell.
///
/// ### Returns
///
/// Pairs of `(sub-cluster, median score)`, sorted by key.
pub fn sub_cluster_median_scores(
    sub_clusters: &[SubClusterKey],
    scores: &[Option<f64>],
) -> Vec<(SubClusterKey, f64)> {
    group_by_label(sub_clusters)
        .into_iter()
        .filter_map(|(key, cells)| {
            let defined: Vec<f64> = cells.iter().filter_map(|&c| scores[c]).collect();
            median(&defined).map(|m| (key, m))
        })
        .collect()
}

/// Per-sample stage: scoring, clustering and the sample-level test
///
/// ### Params
///
/// * `dataset` - The expression data.
/// * `sample` - The sample to process.
/// * `params` - The `QcParams`.
///
/// ### Returns
///
/// The `SampleResult`
pub fn process_sample(
    dataset: &ExpressionDataset,
    sample: &Sample,
    params: &QcParams,
) -> QcResult<SampleResult> {
    let start = Instant::now();
    let counts = dataset.counts();
    let size_factors = dataset.size_factors();

    let scores = DoubletScorer::new(counts, size_factors, &sample.cells, params.doublet.clone())
        .run_scoring()?;
    let clustering = cluster_sample(counts, &sample.cells, size_factors, &params.cluster)?;

    let stats = sub_cluster_median_scores(&clustering.sub_clusters, &scores.scores);
    let test = test_family(FamilyId::Sample(sample.id.clone()), &stats, &params.outlier);
    let flagged = test.outliers();
    let sample_doublet: Vec<bool> = clustering
        .sub_clusters
        .iter()
        .map(|key| flagged.contains(key))
        .collect();

    log::info!(
        "Sample '{}': {} cells, {} clusters, {} sub-clusters flagged, {} sample doublets. Done in {:.2?}",
        sample.id,
        sample.n_cells(),
        clustering.n_clusters(),
        flagged.len(),
        sample_doublet.iter().filter(|&&d| d).count(),
        start.elapsed()
    );

    Ok(SampleResult {
        sample: sample.id.clone(),
        cells: sample.cells.clone(),
        scores,
        clustering,
        test,
        sample_doublet,
    })
}

////////////////////
// Main structure //
////////////////////

/// The QC pipeline
#[derive(Clone, Debug, Default)]
pub struct QcPipeline {
    params: QcParams,
}

impl QcPipeline {
    /// Generate a new instance
    pub fn new(params: QcParams) -> Self {
        Self { params }
    }

    /// The parameters
    pub fn params(&self) -> &QcParams {
        &self.params
    }

    /// Run the full pipeline
    ///
    /// ### Params
    ///
    /// * `dataset` - The expression data.
    /// * `annotation` - Gene to chromosome annotation.
    ///
    /// ### Returns
    ///
    /// The `QcResults`
    pub fn run(
        &self,
        dataset: &ExpressionDataset,
        annotation: &GeneAnnotation,
    ) -> QcResult<QcResults> {
        match self.params.n_threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
                pool.install(|| self.run_inner(dataset, annotation))
            }
            None => self.run_inner(dataset, annotation),
        }
    }

    fn run_inner(
        &self,
        dataset: &ExpressionDataset,
        annotation: &GeneAnnotation,
    ) -> QcResult<QcResults> {
        let start_all = Instant::now();
        let samples = dataset.samples()?;
        log::info!(
            "Running QC on {} cells ({} genes) in {} samples",
            dataset.n_cells(),
            dataset.n_genes(),
            samples.len()
        );

        // fail before the expensive per-sample stage
        for sample in &samples {
            if !self.params.stage_order.contains(&sample.stage) {
                return Err(QcError::UnorderedStage {
                    sample: sample.id.clone(),
                    stage: sample.stage.clone(),
                    order: self.params.stage_order.clone(),
                });
            }
        }

        let start_samples = Instant::now();
        let sample_results = self.run_samples(dataset, &samples)?;
        log::info!(
            "Per-sample stage done in {:.2?}",
            start_samples.elapsed()
        );

        let n_cells = dataset.n_cells();
        let mut sample_doublet = vec![false; n_cells];
        let mut genes: Vec<usize> = Vec::new();
        for res in &sample_results {
            for (pos, &cell) in res.cells.iter().enumerate() {
                sample_doublet[cell] = res.sample_doublet[pos];
            }
            genes.extend(res.scores.hvgs.iter().copied());
        }
        genes.sort_unstable();
        genes.dedup();

        let refinement = refine_calls(
            dataset,
            &samples,
            &genes,
            &sample_doublet,
            &self.params.stage_order,
            &self.params.mnn,
            &self.params.cluster,
            &self.params.outlier,
        )?;

        let quality = CellQuality::calculate(
            dataset,
            annotation,
            &self.params.stripped.mito_chromosome,
        );
        if annotation.is_empty() {
            log::warn!("Empty gene annotation; no stripped nuclei can be called");
        }
        let stripped =
            classify_stripped(&refinement.pooled_clusters, &quality, &self.params.stripped);

        let cells = assemble_cells(dataset, &sample_results, &refinement, &stripped, &quality);

        log::info!(
            "Finished QC: {} sample doublets, {} cluster doublets, {} stripped nuclei. Done in {:.2?}",
            cells
                .iter()
                .filter(|c| c.doublet_label == DoubletLabel::SampleDoublet)
                .count(),
            cells
                .iter()
                .filter(|c| c.doublet_label == DoubletLabel::ClusterDoublet)
                .count(),
            stripped.n_stripped_cells(),
            start_all.elapsed()
        );

        Ok(QcResults {
            samples: sample_results,
            refinement,
            stripped,
            cells,
        })
    }

    fn run_samples(
        &self,
        dataset: &ExpressionDataset,
        samples: &[Sample],
    ) -> QcResult<Vec<SampleResult>> {
        samples
            .par_iter()
            .map(|sample| {
                process_sample(dataset, sample, &self.params).map_err(|e| {
                    QcError::SampleFailed {
                        sample: sample.id.clone(),
                        source: Box::new(e),
                    }
                })
            })
            .collect()
    }
}

fn assemble_cells(
    dataset: &ExpressionDataset,
    sample_results: &[SampleResult],
    refinement: &RefinementResult,
    stripped: &StrippedResult,
    quality: &CellQuality,
) -> Vec<CellQc> {
    let n_cells = dataset.n_cells();
    let mut scores = vec![None; n_cells];
    let mut sample_cluster = vec![0; n_cells];
    let mut sub_cluster = vec![
        SubClusterKey {
            cluster: 0,
            sub_cluster: 0
        };
        n_cells
    ];
    for res in sample_results {
        for (pos, &cell) in res.cells.iter().enumerate() {
            scores[cell] = res.scores.scores[pos];
            sample_cluster[cell] = res.clustering.clusters[pos];
            sub_cluster[cell] = res.clustering.sub_clusters[pos];
        }
    }

    dataset
        .cells()
        .iter()
        .enumerate()
        .map(|(i, meta)| CellQc {
            barcode: meta.barcode.clone(),
            sample: meta.sample.clone(),
            stage: meta.stage.clone(),
            doublet_score: scores[i],
            sample_cluster: sample_cluster[i],
            sub_cluster: sub_cluster[i],
            pooled_cluster: refinement.pooled_clusters[i],
            doublet_label: refinement.labels[i],
            mito_fraction: quality.mito_fraction[i],
            lib_size: quality.lib_size[i],
            stripped: stripped.stripped[i],
        })
        .collect()
}
