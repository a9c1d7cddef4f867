use scqc::core::data::dataset::{CellMetadata, ExpressionDataset, GeneAnnotation, GeneInfo};
use scqc::core::data::sparse_structures::CountMatrix;
use scqc::core::data::synthetic_data::*;
use scqc::single_cell::methods::call_refinement::DoubletLabel;
use scqc::single_cell::methods::clustering::ClusterParams;
use scqc::single_cell::methods::doublet_detection::DoubletParams;
use scqc::single_cell::validation::validation_report;
use scqc::{QcError, QcParams, QcPipeline, QcResults};

const N_TYPES: usize = 9;
const MARKERS: usize = 6;

fn config(sizes: Vec<usize>, seed: u64) -> SyntheticSampleConfig {
    SyntheticSampleConfig {
        cell_type_sizes: sizes,
        markers_per_type: MARKERS,
        markers_per_cell: (MARKERS, MARKERS),
        seed,
        ..Default::default()
    }
}

/// Sample 1: 90 singlets of nine types plus 10 doublets of types 0 and 1.
/// Sample 2: 100 singlets of the same nine types.
fn two_samples() -> (SyntheticSample, SyntheticSample) {
    let s1 = create_celltype_sparse_csr_data(&config(vec![10; N_TYPES], 11));
    let pairs = random_doublet_pairs(&s1, 0, 1, 10, 5);
    let s1 = inject_doublets(s1, &pairs).unwrap();
    let s2 = create_celltype_sparse_csr_data(&config(vec![12, 12, 12, 12, 12, 10, 10, 10, 10], 23));
    (s1, s2)
}

fn stack(a: &CountMatrix, b: &CountMatrix) -> CountMatrix {
    assert_eq!(a.shape().1, b.shape().1);
    let mut data = a.data.clone();
    let mut indices = a.indices.clone();
    let mut indptr = a.indptr.clone();
    let offset = a.get_nnz();
    data.extend_from_slice(&b.data);
    indices.extend_from_slice(&b.indices);
    indptr.extend(b.indptr.iter().skip(1).map(|p| p + offset));
    CountMatrix::new_csr(data, indices, indptr, (a.shape().0 + b.shape().0, a.shape().1)).unwrap()
}

fn dataset(stage_1: &str, stage_2: &str) -> (ExpressionDataset, GeneAnnotation, Vec<bool>) {
    let (s1, s2) = two_samples();
    let counts = stack(&s1.counts, &s2.counts);
    let n_genes = counts.shape().1;

    let mut cells = Vec::new();
    for (sample, stage, n) in [("s1", stage_1, s1.n_cells()), ("s2", stage_2, s2.n_cells())] {
        for i in 0..n {
            cells.push(CellMetadata {
                barcode: format!("{}_{}", sample, i),
                sample: sample.to_string(),
                stage: stage.to_string(),
            });
        }
    }
    let genes: Vec<GeneInfo> = (0..n_genes)
        .map(|g| GeneInfo {
            id: format!("gene{}", g),
            symbol: None,
        })
        .collect();

    // dense housekeeping genes with odd index below 40 are mitochondrial
    let hk_start = N_TYPES * MARKERS;
    let annotation = GeneAnnotation::new((0..n_genes).map(|g| {
        let chrom = if g >= hk_start && (g - hk_start) % 2 == 1 && g - hk_start < 40 {
            "MT"
        } else {
            "1"
        };
        (format!("gene{}", g), chrom.to_string())
    }));

    let mut injected = s1.is_doublet();
    injected.extend(vec![false; s2.n_cells()]);

    let n_cells = cells.len();
    let dataset = ExpressionDataset::new(counts, cells, genes, Some(vec![1.0; n_cells])).unwrap();
    (dataset, annotation, injected)
}

fn params() -> QcParams {
    QcParams {
        doublet: DoubletParams {
            n_simulated: 3000,
            ..Default::default()
        },
        cluster: ClusterParams {
            k: 8,
            ..Default::default()
        },
        n_threads: Some(2),
        ..Default::default()
    }
}

fn run() -> (ExpressionDataset, GeneAnnotation, Vec<bool>, QcResults) {
    let (dataset, annotation, injected) = dataset("E7.5", "E7.0");
    let results = QcPipeline::new(params()).run(&dataset, &annotation).unwrap();
    (dataset, annotation, injected, results)
}

#[test]
fn test_injected_doublets_are_recovered() {
    let (dataset, annotation, injected, results) = run();
    assert_eq!(results.cells.len(), 200);
    assert_eq!(results.samples.len(), 2);

    let doublets: Vec<usize> = (0..200).filter(|&i| injected[i]).collect();
    assert_eq!(doublets, (90..100).collect::<Vec<_>>());

    // scores: doublets sit in the top quartile of their sample
    let mut s1_scores: Vec<f64> = results.cells[..100]
        .iter()
        .filter_map(|c| c.doublet_score)
        .collect();
    assert_eq!(s1_scores.len(), 100);
    s1_scores.sort_by(|a, b| b.total_cmp(a));
    let top_quartile = s1_scores[24];
    let n_top = doublets
        .iter()
        .filter(|&&i| results.cells[i].doublet_score.unwrap() >= top_quartile)
        .count();
    assert!(n_top >= 8, "{} doublets in the top quartile", n_top);

    // clustering: most doublets share one small Layer-1 cluster
    let mut per_cluster = std::collections::BTreeMap::new();
    for &i in &doublets {
        *per_cluster.entry(results.cells[i].sample_cluster).or_insert(0) += 1;
    }
    let (&main_cluster, &n_main) = per_cluster.iter().max_by_key(|(_, n)| **n).unwrap();
    assert!(n_main >= 8, "doublets spread over {:?}", per_cluster);
    let cluster_size = results.cells[..100]
        .iter()
        .filter(|c| c.sample_cluster == main_cluster)
        .count();
    assert!(cluster_size < 50);

    // outlier test: the doublet sub-cluster is called
    let n_called = doublets
        .iter()
        .filter(|&&i| results.cells[i].doublet_label == DoubletLabel::SampleDoublet)
        .count();
    assert!(n_called >= 8, "{} doublets called", n_called);
    assert!(results.samples[0].test.is_tested());

    // the table carries the refined labels
    for (res, cell) in results.refinement.labels.iter().zip(results.cells.iter()) {
        assert_eq!(*res, cell.doublet_label);
    }

    // normal mitochondrial content everywhere
    assert_eq!(results.stripped.n_stripped_cells(), 0);
    assert!(results.cells.iter().all(|c| c.mito_fraction.unwrap() > 0.01));

    let report = validation_report(&dataset, &annotation, &results, &Default::default());
    assert!(!report.female_marker_found);
    assert_eq!(report.labels.iter().map(|s| s.n_cells).sum::<usize>(), 200);
    assert!(report.to_string().contains("not informative"));
}

#[test]
fn test_result_table() {
    let (_, _, _, results) = run();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qc.tsv");
    results.write_tsv(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 201);
    assert!(lines[0].starts_with("barcode\tsample\tstage\tdoublet_score"));
    for line in &lines[1..] {
        assert_eq!(line.split('\t').count(), 10);
    }
    let first: Vec<&str> = lines[1].split('\t').collect();
    assert_eq!(first[0], "s1_0");
    assert_eq!(first[2], "E7.5");
    assert!(["singlet", "sample_doublet", "cluster_doublet"].contains(&first[7]));
}

#[test]
fn test_unknown_stage_fails_early() {
    let (dataset, annotation, _) = dataset("E7.5", "E12.5");
    let err = QcPipeline::new(params()).run(&dataset, &annotation).unwrap_err();
    match err {
        QcError::UnorderedStage { sample, stage, .. } => {
            assert_eq!(sample, "s2");
            assert_eq!(stage, "E12.5");
        }
        other => panic!("unexpected error {}", other),
    }
}
