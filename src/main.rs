use clap::Parser;
use std::process::ExitCode;
use std::time::Instant;

use scqc::core::data::dataset::ExpressionDataset;
use scqc::core::data::metadata_io::{read_annotation_tsv, read_cells_tsv, read_genes_tsv};
use scqc::core::data::sparse_io_mtx::MtxReader;
use scqc::core::graph::knn::parse_knn_method;
use scqc::single_cell::validation::validation_report;
use scqc::{QcError, QcParams, QcPipeline, QcResult};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
///
/// `scqc` doublet and stripped nucleus detection for single cell RNA-seq
///
/// Scores doublets per sample, refines the calls on the batch corrected
/// pooled data and flags stripped nuclei. Writes one row per cell.
///
struct Cli {
    /// counts in MatrixMarket coordinate format (genes x cells by default)
    #[arg(long)]
    counts: Box<str>,

    /// gene table `.tsv` (gene id, optional symbol)
    #[arg(long)]
    genes: Box<str>,

    /// cell table `.tsv` with header (barcode, sample, stage, optional
    /// size_factor)
    #[arg(long)]
    cells: Box<str>,

    /// gene to chromosome annotation `.tsv`
    #[arg(long)]
    annotation: Box<str>,

    /// parameter file (JSON); missing keys keep their defaults
    #[arg(long)]
    params: Option<Box<str>>,

    /// the count matrix is stored as cells x genes
    #[arg(long, default_value_t = false)]
    transpose: bool,

    /// number of worker threads (overrides the parameter file)
    #[arg(long)]
    threads: Option<usize>,

    /// kNN search for clustering and MNN pairs: exact or hnsw
    /// (overrides the parameter file)
    #[arg(long)]
    knn: Option<Box<str>>,

    /// output `.tsv`
    #[arg(short, long)]
    out: Box<str>,

    /// debug logging (unless RUST_LOG is set)
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn run(cli: &Cli) -> QcResult<()> {
    let start = Instant::now();

    let mut params = match &cli.params {
        Some(path) => QcParams::from_json_file(path.as_ref())?,
        None => QcParams::default(),
    };
    if cli.threads.is_some() {
        params.n_threads = cli.threads;
    }
    if let Some(knn) = &cli.knn {
        let method = parse_knn_method(knn)
            .ok_or_else(|| QcError::InvalidInput(format!("unknown kNN search '{}'", knn)))?;
        params.cluster.knn_method = method;
        params.mnn.knn_method = method;
    }

    let counts = MtxReader::new(cli.counts.as_ref())?.read_counts(cli.transpose)?;
    let genes = read_genes_tsv(cli.genes.as_ref())?;
    let (cells, size_factors) = read_cells_tsv(cli.cells.as_ref())?;
    let annotation = read_annotation_tsv(cli.annotation.as_ref())?;
    let dataset = ExpressionDataset::new(counts, cells, genes, size_factors)?;
    log::info!(
        "Loaded {} cells x {} genes ({} annotated) in {:.2?}",
        dataset.n_cells(),
        dataset.n_genes(),
        annotation.len(),
        start.elapsed()
    );

    let pipeline = QcPipeline::new(params);
    let results = pipeline.run(&dataset, &annotation)?;
    results.write_tsv(cli.out.as_ref())?;

    let report = validation_report(
        &dataset,
        &annotation,
        &results,
        &pipeline.params().validation,
    );
    log::info!("Validation report:\n{}", report);
    log::info!("Wrote {}. Total run time {:.2?}", cli.out, start.elapsed());

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
