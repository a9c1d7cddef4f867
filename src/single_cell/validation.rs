use serde::Deserialize;
use std::fmt;

use crate::core::base::stats::median;
use crate::core::data::dataset::{ExpressionDataset, GeneAnnotation};
use crate::single_cell::methods::call_refinement::DoubletLabel;
use crate::single_cell::pipeline::QcResults;

////////////
// Params //
////////////

/// Parameters of the validation report
///
/// ### Fields
///
/// * `female_marker` - Gene id or symbol of the female marker.
/// * `y_chromosome` - Name of the Y chromosome in the annotation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    pub female_marker: String,
    pub y_chromosome: String,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            female_marker: "Xist".to_string(),
            y_chromosome: "Y".to_string(),
        }
    }
}

/////////////
// Results //
/////////////

/// Summary of the cells with one final label
///
/// ### Fields
///
/// * `label` - The `DoubletLabel`.
/// * `n_cells` - Number of cells.
/// * `median_lib_size` - Median library size; `None` without cells.
/// * `sex_coexpression` - Fraction of cells expressing the female marker
///   and at least one Y gene; `None` without cells.
#[derive(Clone, Debug)]
pub struct LabelSummary {
    pub label: DoubletLabel,
    pub n_cells: usize,
    pub median_lib_size: Option<f64>,
    pub sex_coexpression: Option<f64>,
}

/// Validation report of a QC run
///
/// ### Fields
///
/// * `labels` - One `LabelSummary` per `DoubletLabel`.
/// * `female_marker_found` - The female marker is part of the genes.
/// * `n_y_genes` - Number of genes on the Y chromosome.
/// * `n_stripped_clusters` - Number of pooled clusters called stripped.
/// * `n_stripped_cells` - Number of cells called stripped.
#[derive(Clone, Debug)]
pub struct QcReport {
    pub labels: Vec<LabelSummary>,
    pub female_marker_found: bool,
    pub n_y_genes: usize,
    pub n_stripped_clusters: usize,
    pub n_stripped_cells: usize,
}

impl QcReport {
    /// Summary of one label
    pub fn summary(&self, label: DoubletLabel) -> Option<&LabelSummary> {
        self.labels.iter().find(|s| s.label == label)
    }
}

fn fmt_optional(x: Option<f64>, digits: usize) -> String {
    match x {
        Some(v) => format!("{:.*}", digits, v),
        None => "NA".to_string(),
    }
}

impl fmt::Display for QcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "label\tn_cells\tmedian_lib_size\tsex_coexpression")?;
        for s in &self.labels {
            writeln!(
                f,
                "{}\t{}\t{}\t{}",
                s.label,
                s.n_cells,
                fmt_optional(s.median_lib_size, 0),
                fmt_optional(s.sex_coexpression, 4)
            )?;
        }
        if !self.female_marker_found || self.n_y_genes == 0 {
            writeln!(
                f,
                "sex coexpression not informative (female marker found: {}, Y genes: {})",
                self.female_marker_found, self.n_y_genes
            )?;
        }
        write!(
            f,
            "stripped nuclei: {} clusters, {} cells",
            self.n_stripped_clusters, self.n_stripped_cells
        )
    }
}

///////////////
// Functions //
///////////////

/// Build the validation report
///
/// ### Params
///
/// * `dataset` - The expression data.
/// * `annotation` - Gene to chromosome annotation.
/// * `results` - The `QcResults` of the same dataset.
/// * `params` - The `ValidationParams`.
///
/// ### Returns
///
/// The `QcReport`
pub fn validation_report(
    dataset: &ExpressionDataset,
    annotation: &GeneAnnotation,
    results: &QcResults,
    params: &ValidationParams,
) -> QcReport {
    let genes = dataset.genes();
    let female: Vec<bool> = genes
        .iter()
        .map(|g| g.matches(&params.female_marker))
        .collect();
    let y_gene: Vec<bool> = annotation
        .chromosomes_of(genes)
        .iter()
        .map(|c| *c == Some(params.y_chromosome.as_str()))
        .collect();

    let counts = dataset.counts();
    let coexpressing: Vec<bool> = (0..dataset.n_cells())
        .map(|i| {
            let (idx, vals) = counts.row(i);
            let mut has_female = false;
            let mut has_y = false;
            for (&g, &v) in idx.iter().zip(vals.iter()) {
                if v > 0 {
                    has_female |= female[g];
                    has_y |= y_gene[g];
                }
            }
            has_female && has_y
        })
        .collect();

    let labels = [
        DoubletLabel::Singlet,
        DoubletLabel::SampleDoublet,
        DoubletLabel::ClusterDoublet,
    ]
    .into_iter()
    .map(|label| {
        let cells: Vec<usize> = results
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.doublet_label == label)
            .map(|(i, _)| i)
            .collect();
        let lib: Vec<f64> = cells
            .iter()
            .map(|&i| results.cells[i].lib_size as f64)
            .collect();
        let sex_coexpression = if cells.is_empty() {
            None
        } else {
            Some(cells.iter().filter(|&&i| coexpressing[i]).count() as f64 / cells.len() as f64)
        };
        LabelSummary {
            label,
            n_cells: cells.len(),
            median_lib_size: median(&lib),
            sex_coexpression,
        }
    })
    .collect();

    QcReport {
        labels,
        female_marker_found: female.iter().any(|&f| f),
        n_y_genes: y_gene.iter().filter(|&&y| y).count(),
        n_stripped_clusters: results.stripped.n_stripped_clusters(),
        n_stripped_cells: results.stripped.n_stripped_cells(),
    }
}
