use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use scqc::core::data::dataset::ExpressionDataset;
use scqc::core::data::metadata_io::{read_annotation_tsv, read_cells_tsv, read_genes_tsv};
use scqc::core::data::sparse_io_mtx::MtxReader;
use scqc::core::data::sparse_structures::CountMatrix;
use scqc::core::data::synthetic_data::{create_celltype_sparse_csr_data, SyntheticSampleConfig};
use scqc::single_cell::processing::CellQuality;

/// Write the counts in the 10x layout (genes in rows, cells in columns)
fn write_mtx(path: &Path, counts: &CountMatrix) {
    let (n_cells, n_genes) = counts.shape();
    let mut w = BufWriter::new(File::create(path).unwrap());
    writeln!(w, "%%MatrixMarket matrix coordinate integer general").unwrap();
    writeln!(w, "% written by the round trip test").unwrap();
    writeln!(w, "{} {} {}", n_genes, n_cells, counts.get_nnz()).unwrap();
    for cell in 0..n_cells {
        let (idx, vals) = counts.row(cell);
        for (&g, &v) in idx.iter().zip(vals.iter()) {
            writeln!(w, "{} {} {}", g + 1, cell + 1, v).unwrap();
        }
    }
}

#[test]
fn test_files_round_trip_into_a_dataset() {
    let sample = create_celltype_sparse_csr_data(&SyntheticSampleConfig::default());
    let (n_cells, n_genes) = sample.counts.shape();
    let dir = tempfile::tempdir().unwrap();

    let mtx = dir.path().join("matrix.mtx");
    write_mtx(&mtx, &sample.counts);

    let genes = dir.path().join("genes.tsv");
    let mut w = BufWriter::new(File::create(&genes).unwrap());
    for g in 0..n_genes {
        if g == 0 {
            writeln!(w, "ENSMUSG{:05}\tXist", g).unwrap();
        } else {
            writeln!(w, "ENSMUSG{:05}", g).unwrap();
        }
    }
    drop(w);

    // columns in a different order than expected
    let cells = dir.path().join("cells.tsv");
    let mut w = BufWriter::new(File::create(&cells).unwrap());
    writeln!(w, "stage\tbarcode\tsample").unwrap();
    for i in 0..n_cells {
        let (sample_id, stage) = if i < 45 { ("s1", "E7.0") } else { ("s2", "E7.5") };
        writeln!(w, "{}\tcell{}\t{}", stage, i, sample_id).unwrap();
    }
    drop(w);

    let annotation = dir.path().join("annotation.tsv");
    let mut w = BufWriter::new(File::create(&annotation).unwrap());
    writeln!(w, "gene_id\tchromosome").unwrap();
    for g in 0..n_genes {
        let chrom = if g == n_genes - 1 { "MT" } else { "1" };
        writeln!(w, "ENSMUSG{:05}\t{}", g, chrom).unwrap();
    }
    drop(w);

    let counts = MtxReader::new(&mtx).unwrap().read_counts(false).unwrap();
    let gene_info = read_genes_tsv(&genes).unwrap();
    let (cell_meta, size_factors) = read_cells_tsv(&cells).unwrap();
    let annotation = read_annotation_tsv(&annotation).unwrap();

    assert!(size_factors.is_none());
    assert_eq!(gene_info[0].symbol.as_deref(), Some("Xist"));
    assert!(gene_info[0].matches("Xist"));
    assert_eq!(gene_info[1].symbol, None);
    assert_eq!(cell_meta[3].barcode, "cell3");
    assert_eq!(cell_meta[50].stage, "E7.5");
    assert_eq!(annotation.len(), n_genes);

    let dataset = ExpressionDataset::new(counts, cell_meta, gene_info, None).unwrap();
    assert_eq!(dataset.n_cells(), n_cells);
    assert_eq!(dataset.n_genes(), n_genes);
    for cell in [0, 17, 44, 89] {
        assert_eq!(dataset.counts().row(cell), sample.counts.row(cell));
    }

    // library-size factors average to one
    let mean_sf = dataset.size_factors().iter().sum::<f64>() / n_cells as f64;
    assert!((mean_sf - 1.0).abs() < 1e-9);

    let samples = dataset.samples().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].id, "s1");
    assert_eq!(samples[0].n_cells(), 45);
    assert_eq!(samples[1].stage, "E7.5");

    // the last gene is a dense housekeeping gene, so every cell has a fraction
    let quality = CellQuality::calculate(&dataset, &annotation, "MT");
    assert!(quality.mito_fraction.iter().all(|f| f.unwrap() > 0.0));
    assert_eq!(quality.lib_size, sample.counts.library_sizes());
}

#[test]
fn test_cells_as_rows_layout() {
    let sample = create_celltype_sparse_csr_data(&SyntheticSampleConfig::default());
    let (n_cells, n_genes) = sample.counts.shape();
    let dir = tempfile::tempdir().unwrap();
    let mtx = dir.path().join("matrix.mtx");

    let mut w = BufWriter::new(File::create(&mtx).unwrap());
    writeln!(w, "%%MatrixMarket matrix coordinate integer general").unwrap();
    writeln!(w, "{} {} {}", n_cells, n_genes, sample.counts.get_nnz()).unwrap();
    for cell in 0..n_cells {
        let (idx, vals) = sample.counts.row(cell);
        for (&g, &v) in idx.iter().zip(vals.iter()) {
            writeln!(w, "{} {} {}", cell + 1, g + 1, v).unwrap();
        }
    }
    drop(w);

    let counts = MtxReader::new(&mtx).unwrap().read_counts(true).unwrap();
    assert_eq!(counts.shape(), (n_cells, n_genes));
    assert_eq!(counts.library_sizes(), sample.counts.library_sizes());
}
